pub mod beatgrid;
pub mod cache;
pub mod key;
pub mod structure;
pub mod tempo;
pub mod types;
pub mod vocals;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stems::{Stem, StemSet};

pub use cache::{AnalysisCache, MemoryCatalog, TrackCatalog, TrackInfo};
pub use key::{KeyMode, MusicalKey, WheelLetter, WheelPosition};
pub use types::{
    Beat, CuePoints, EnergyCurve, Section, SectionKind, TrackAnalysis, VocalActivity, VocalSegment,
};
pub use worker::{AnalysisOutcome, AnalysisWorker};

/// Why a stage could not produce a measured result. Always recovered inside
/// [`TrackAnalyzer`] by substituting defaults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisFailure {
    #[error("buffer is silent")]
    Silent,
    #[error("buffer is too short")]
    TooShort,
    #[error("only {0} onsets detected")]
    TooFewBeats(usize),
}

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub energy_window_secs: f64,
    pub vocal_window_secs: f64,
    /// Relative change between adjacent energy windows that marks a boundary.
    pub boundary_change_ratio: f32,
    pub min_boundary_spacing_secs: f64,
    pub intro_fraction: f64,
    pub outro_fraction: f64,
    /// Percentile of the vocal curve above which the voice counts as present.
    pub vocal_percentile: f32,
    pub min_vocal_segment_secs: f64,
    pub fallback_bpm: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            energy_window_secs: 1.0,
            vocal_window_secs: 0.5,
            boundary_change_ratio: 0.3,
            min_boundary_spacing_secs: 8.0,
            intro_fraction: 0.2,
            outro_fraction: 0.85,
            vocal_percentile: 0.75,
            min_vocal_segment_secs: 2.0,
            fallback_bpm: 120.0,
        }
    }
}

// ── Analyzer ────────────────────────────────────────────────────────────────

/// Stateless track analysis over decoded stems.
#[derive(Debug, Clone, Default)]
pub struct TrackAnalyzer {
    config: AnalysisConfig,
}

impl TrackAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Full analysis. Never fails: any stage that cannot measure falls back to
    /// defaults and the result is flagged `is_fallback`.
    pub fn analyze(&self, stems: &StemSet) -> TrackAnalysis {
        let never = AtomicBool::new(false);
        self.analyze_cancellable(stems, &never)
            .unwrap_or_else(|| self.fallback(&stems.track_id, stems.duration_secs()))
    }

    /// Like [`analyze`](Self::analyze) but gives up between stages once
    /// `cancel` is set, returning `None`.
    pub fn analyze_cancellable(&self, stems: &StemSet, cancel: &AtomicBool) -> Option<TrackAnalysis> {
        let track_id = stems.track_id.as_str();
        let duration = stems.duration_secs();
        let sample_rate = stems.sample_rate();
        if stems.is_empty() || duration <= 0.0 {
            log::warn!("Analysis of {track_id}: no audio, using defaults");
            return Some(self.fallback(track_id, duration));
        }

        let mixdown = stems.mixdown();
        let rhythm = stem_buffers(stems, &[Stem::Drums, Stem::Bass, Stem::Other], &mixdown);
        let tempo = match tempo::estimate_tempo_multi(&rhythm, sample_rate) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Tempo estimation for {track_id} failed ({e}), using defaults");
                return Some(self.fallback(track_id, duration));
            }
        };
        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        let harmonic = stem_buffers(stems, &[Stem::Bass, Stem::Other, Stem::Vocals], &mixdown);
        let (key, key_fallback) = match key::estimate_key(&harmonic, sample_rate) {
            Ok(k) => (k, false),
            Err(e) => {
                log::warn!("Key estimation for {track_id} failed ({e}), assuming 8B");
                (MusicalKey::c_major(), true)
            }
        };
        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        let energy = structure::energy_curve(&mixdown, sample_rate, self.config.energy_window_secs);
        let beat_grid = beatgrid::build_beat_grid(tempo.bpm, duration, &tempo.onsets, &energy);
        let sections = structure::segment(&energy, &beat_grid, duration, &self.config);
        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        let vocal_activity = vocals::vocal_activity(stems.get(Stem::Vocals), duration, &self.config);
        let cue_points = cue_points(duration, &sections, &beat_grid, &vocal_activity);

        log::info!(
            "Analyzed {track_id}: {:.1} BPM ({:.2}), {} ({}), {} beats, {} sections",
            tempo.bpm,
            tempo.confidence,
            key.name(),
            key.wheel.code(),
            beat_grid.len(),
            sections.len()
        );

        Some(TrackAnalysis {
            track_id: track_id.to_string(),
            tempo_bpm: tempo.bpm,
            tempo_confidence: tempo.confidence,
            key,
            beat_grid,
            sections,
            duration_seconds: duration,
            energy_curve: energy,
            vocal_activity,
            cue_points,
            is_fallback: key_fallback,
        })
    }

    /// Default analysis: fixed tempo, 8B, a grid over the whole duration and
    /// a flat energy curve.
    pub fn fallback(&self, track_id: &str, duration: f64) -> TrackAnalysis {
        let duration = duration.max(0.0);
        let bpm = self.config.fallback_bpm;
        let energy = EnergyCurve::flat(duration, self.config.energy_window_secs, 0.5);
        let beat_grid = beatgrid::synthetic_grid(bpm, duration, &energy);
        let sections = structure::segment(&energy, &beat_grid, duration, &self.config);
        let vocal_activity = VocalActivity::silent(duration, self.config.vocal_window_secs);
        let cue_points = cue_points(duration, &sections, &beat_grid, &vocal_activity);

        TrackAnalysis {
            track_id: track_id.to_string(),
            tempo_bpm: bpm,
            tempo_confidence: 0.0,
            key: MusicalKey::c_major(),
            beat_grid,
            sections,
            duration_seconds: duration,
            energy_curve: energy,
            vocal_activity,
            cue_points,
            is_fallback: true,
        }
    }
}

/// The listed stems that are present, or the mixdown when none are.
fn stem_buffers<'a>(stems: &'a StemSet, wanted: &[Stem], mixdown: &'a [f32]) -> Vec<&'a [f32]> {
    let found: Vec<&[f32]> = wanted
        .iter()
        .filter_map(|s| stems.get(*s))
        .filter(|b| !b.samples.is_empty())
        .map(|b| b.samples.as_slice())
        .collect();
    if found.is_empty() {
        vec![mixdown]
    } else {
        found
    }
}

// ── Cue points ──────────────────────────────────────────────────────────────

const CUE_IN_MAX_FRACTION: f64 = 0.3;
const CUE_OUT_MIN_FRACTION: f64 = 0.7;
const CUE_OUT_DEFAULT_FRACTION: f64 = 0.85;
const CUE_OUT_VOCAL_TAIL_SECS: f64 = 2.0;

fn cue_points(
    duration: f64,
    sections: &[Section],
    grid: &[Beat],
    vocals: &VocalActivity,
) -> CuePoints {
    let snap = |t: f64| {
        grid.iter()
            .map(|b| b.time_seconds)
            .min_by(|a, b| (a - t).abs().total_cmp(&(b - t).abs()))
            .unwrap_or(t)
    };

    let cue_in_cap = duration * CUE_IN_MAX_FRACTION;
    let intro_end = sections
        .iter()
        .find(|s| s.kind == SectionKind::Intro)
        .map(|s| s.end_seconds)
        .unwrap_or(0.0);
    let mut cue_in = snap(intro_end.min(cue_in_cap));
    if cue_in > cue_in_cap {
        cue_in = cue_in_cap;
    }

    let mut cue_out = sections
        .iter()
        .find(|s| s.kind == SectionKind::Outro)
        .map(|s| s.start_seconds)
        .unwrap_or(duration * CUE_OUT_DEFAULT_FRACTION);
    if let Some(seg) = vocals
        .segments
        .iter()
        .find(|s| cue_out >= s.start_seconds && cue_out < s.end_seconds)
    {
        cue_out = seg.end_seconds + CUE_OUT_VOCAL_TAIL_SECS;
    }
    cue_out = snap(cue_out.max(duration * CUE_OUT_MIN_FRACTION));
    if cue_out >= duration {
        cue_out = (duration * CUE_OUT_DEFAULT_FRACTION).max(cue_in);
    }

    CuePoints {
        cue_in_seconds: cue_in,
        cue_out_seconds: cue_out.max(cue_in),
    }
}
