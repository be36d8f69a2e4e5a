use serde::{Deserialize, Serialize};

use crate::audio::analyzer::{TrackAnalysis, WheelPosition};

// ── Config ──────────────────────────────────────────────────────────────────

/// Thresholds for `overall_compatible`. Empirical defaults; tune per genre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityConfig {
    pub max_tempo_delta_bpm: f64,
    pub min_harmonic_score: f32,
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            max_tempo_delta_bpm: 12.0,
            min_harmonic_score: 0.6,
        }
    }
}

// ── Harmonic relation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmonicRelation {
    Identical,
    /// Same number, other ring (relative major/minor).
    Relative,
    /// One step around the same ring.
    Adjacent,
    /// Five steps around the same ring.
    Fifth,
    /// One step and a ring change.
    Diagonal,
    /// Six steps; the far side of the wheel.
    Opposite,
    Clash,
}

impl HarmonicRelation {
    pub fn between(a: &WheelPosition, b: &WheelPosition) -> Self {
        let distance = a.ring_distance(b);
        let same_ring = a.letter == b.letter;
        match (same_ring, distance) {
            (true, 0) => Self::Identical,
            (false, 0) => Self::Relative,
            (true, 1) => Self::Adjacent,
            (true, 5) => Self::Fifth,
            (false, 1) => Self::Diagonal,
            (_, 6) => Self::Opposite,
            _ => Self::Clash,
        }
    }

    pub fn score(self) -> f32 {
        match self {
            Self::Identical => 1.0,
            Self::Relative => 0.9,
            Self::Adjacent => 0.8,
            Self::Fifth => 0.7,
            Self::Diagonal => 0.5,
            Self::Clash => 0.4,
            Self::Opposite => 0.3,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Identical => "same key",
            Self::Relative => "relative major/minor",
            Self::Adjacent => "adjacent on the wheel",
            Self::Fifth => "fifth relation",
            Self::Diagonal => "diagonal move, some tension",
            Self::Opposite => "opposite side of the wheel, clash risk",
            Self::Clash => "distant keys, clash risk",
        }
    }
}

// ── Tempo class ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempoClass {
    Perfect,
    Good,
    Acceptable,
    HalfTime,
    Poor,
}

impl TempoClass {
    pub fn between(bpm_a: f64, bpm_b: f64) -> Self {
        let delta = (bpm_a - bpm_b).abs();
        let (lo, hi) = if bpm_a <= bpm_b { (bpm_a, bpm_b) } else { (bpm_b, bpm_a) };
        if delta <= 2.0 {
            Self::Perfect
        } else if delta <= 6.0 {
            Self::Good
        } else if lo > 0.0 && hi / lo <= 1.06 {
            Self::Acceptable
        } else if (2.0 * lo - hi).abs() <= 6.0 {
            Self::HalfTime
        } else {
            Self::Poor
        }
    }

    pub fn score(self) -> f32 {
        match self {
            Self::Perfect => 1.0,
            Self::Good => 0.9,
            Self::Acceptable => 0.7,
            Self::HalfTime => 0.6,
            Self::Poor => 0.3,
        }
    }

    /// Adjustment applied to a plan's success probability.
    pub fn probability_bonus(self) -> f32 {
        match self {
            Self::Perfect => 0.2,
            Self::Good => 0.1,
            Self::Poor => -0.2,
            Self::Acceptable | Self::HalfTime => 0.0,
        }
    }
}

// ── Score ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityScore {
    pub tempo_delta_bpm: f64,
    pub tempo_class: TempoClass,
    pub harmonic_score: f32,
    pub harmonic_reason: HarmonicRelation,
    pub overall_compatible: bool,
}

/// Pure tempo and key comparison. Symmetric in its two arguments.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityEvaluator {
    config: CompatibilityConfig,
}

impl CompatibilityEvaluator {
    pub fn new(config: CompatibilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompatibilityConfig {
        &self.config
    }

    pub fn evaluate(&self, a: &TrackAnalysis, b: &TrackAnalysis) -> CompatibilityScore {
        self.score(a.tempo_bpm, &a.key.wheel, b.tempo_bpm, &b.key.wheel)
    }

    pub fn score(
        &self,
        bpm_a: f64,
        wheel_a: &WheelPosition,
        bpm_b: f64,
        wheel_b: &WheelPosition,
    ) -> CompatibilityScore {
        let tempo_delta_bpm = (bpm_a - bpm_b).abs();
        let relation = HarmonicRelation::between(wheel_a, wheel_b);
        let harmonic_score = relation.score();
        CompatibilityScore {
            tempo_delta_bpm,
            tempo_class: TempoClass::between(bpm_a, bpm_b),
            harmonic_score,
            harmonic_reason: relation,
            overall_compatible: tempo_delta_bpm <= self.config.max_tempo_delta_bpm
                && harmonic_score >= self.config.min_harmonic_score,
        }
    }
}

// ── Beatmatch ───────────────────────────────────────────────────────────────

const NATIVE_SYNC_DELTA: f64 = 0.5;
const MEET_IN_MIDDLE_DELTA: f64 = 6.0;
const MIN_RATE: f64 = 0.94;
const MAX_RATE: f64 = 1.06;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// Already close enough to play at native speed.
    Native,
    /// Both decks stretch toward the mean tempo.
    MeetInMiddle,
    /// Too far apart to stretch; play at native speed and rely on the style.
    None,
}

/// Playback rates a host would apply for the overlap. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatmatchPlan {
    pub sync: SyncMethod,
    pub target_bpm: f64,
    pub outgoing_rate: f64,
    pub incoming_rate: f64,
}

pub fn beatmatch(outgoing_bpm: f64, incoming_bpm: f64) -> BeatmatchPlan {
    let delta = (outgoing_bpm - incoming_bpm).abs();
    if outgoing_bpm <= 0.0 || incoming_bpm <= 0.0 || delta > MEET_IN_MIDDLE_DELTA {
        return BeatmatchPlan {
            sync: SyncMethod::None,
            target_bpm: incoming_bpm,
            outgoing_rate: 1.0,
            incoming_rate: 1.0,
        };
    }
    if delta <= NATIVE_SYNC_DELTA {
        return BeatmatchPlan {
            sync: SyncMethod::Native,
            target_bpm: outgoing_bpm,
            outgoing_rate: 1.0,
            incoming_rate: 1.0,
        };
    }
    let target = (outgoing_bpm + incoming_bpm) / 2.0;
    BeatmatchPlan {
        sync: SyncMethod::MeetInMiddle,
        target_bpm: target,
        outgoing_rate: (target / outgoing_bpm).clamp(MIN_RATE, MAX_RATE),
        incoming_rate: (target / incoming_bpm).clamp(MIN_RATE, MAX_RATE),
    }
}
