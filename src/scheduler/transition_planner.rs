use serde::{Deserialize, Serialize};

use crate::audio::{
    analyzer::{SectionKind, TrackAnalysis},
    dsp::{echo::EchoSettings, filter::FilterState, FxChange},
};

use super::{
    compatibility::{beatmatch, BeatmatchPlan, CompatibilityEvaluator, CompatibilityScore, TempoClass},
    stem_schedule::StemSchedule,
};

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerState {
    Idle,
    SearchingExit,
    SearchingEntry,
    StyleSelection,
    PhaseScheduling,
    Ready,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePointKind {
    // exit points
    PhraseStart,
    SectionBoundary,
    VocalTransition,
    CueOut,
    /// First bar of a four-bar group when no structural marker is near.
    BarGroup,
    Downbeat,
    Emergency,
    Immediate,
    // entry points
    TrackStart,
    VocalEntry,
    HighEnergy,
    Breakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub time_seconds: f64,
    pub kind: TimePointKind,
    pub description: String,
}

impl TimePoint {
    fn new(time_seconds: f64, kind: TimePointKind, description: impl Into<String>) -> Self {
        Self {
            time_seconds,
            kind,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyClass {
    Low,
    Medium,
    High,
    Variable,
}

impl EnergyClass {
    pub fn from_level(level: f32) -> Self {
        if level < 0.33 {
            Self::Low
        } else if level < 0.66 {
            Self::Medium
        } else {
            Self::High
        }
    }

    /// Energy an exit of this kind calls for in the incoming track.
    pub fn implied_by(kind: TimePointKind) -> Self {
        match kind {
            TimePointKind::SectionBoundary => Self::High,
            TimePointKind::PhraseStart => Self::Medium,
            TimePointKind::VocalTransition | TimePointKind::CueOut => Self::Low,
            _ => Self::Variable,
        }
    }

    fn rank(self) -> Option<i8> {
        match self {
            Self::Low => Some(0),
            Self::Medium => Some(1),
            Self::High => Some(2),
            Self::Variable => None,
        }
    }

    fn match_score(wanted: Self, candidate: Self) -> f32 {
        match (wanted.rank(), candidate.rank()) {
            (None, _) | (_, None) => 0.6,
            (Some(a), Some(b)) if a == b => 1.0,
            (Some(a), Some(b)) if (a - b).abs() == 1 => 0.5,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStyle {
    /// Beat-synchronized cut on a section boundary.
    HardCut,
    /// Gradual per-stem handover around vocals.
    StemTransition,
    /// Staged handover with the outgoing deck fed into an echo.
    EchoTransition,
    AdaptiveCrossfade,
    /// Short crossfade forced by the end of the track.
    Emergency,
    /// No usable plan; the caller substitutes a plain crossfade.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Autonomous monitoring near the end of a track.
    Auto,
    /// Operator-triggered; short look-ahead.
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoNextTrack,
    NoExitPoint,
    LowProbability,
    InvalidSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckRole {
    Outgoing,
    Incoming,
}

/// Effect change anchored to the transition start like the stem phases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectCue {
    pub role: DeckRole,
    pub offset_ms: u64,
    pub change: FxChange,
}

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub look_ahead_secs: f64,
    pub quick_look_ahead_secs: f64,
    /// Below this much remaining time an exit is forced at the current position.
    pub emergency_remaining_secs: f64,
    /// Gap between handover phases as a fraction of the transition.
    pub phase_spacing: f64,
    pub min_viable_probability: f32,
    pub fallback_crossfade_secs: f64,
    pub crossfade_secs: f64,
    pub echo_secs: f64,
    pub section_crossfade_secs: f64,
    pub emergency_secs: f64,
    pub stem_transition_secs: f64,
    /// High-pass applied to the outgoing deck when keys or tempos clash.
    pub clash_low_cut_hz: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            look_ahead_secs: 16.0,
            quick_look_ahead_secs: 4.0,
            emergency_remaining_secs: 8.0,
            phase_spacing: 0.25,
            min_viable_probability: 0.3,
            fallback_crossfade_secs: 8.0,
            crossfade_secs: 8.0,
            echo_secs: 4.0,
            section_crossfade_secs: 2.0,
            emergency_secs: 1.0,
            stem_transition_secs: 8.0,
            clash_low_cut_hz: 300.0,
        }
    }
}

// ── Plan ────────────────────────────────────────────────────────────────────

/// One transition attempt. Built once, consumed once by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub outgoing_track: String,
    pub incoming_track: Option<String>,
    pub exit_point: TimePoint,
    pub entry_point: TimePoint,
    pub style: TransitionStyle,
    pub duration_ms: u64,
    pub stem_schedule: StemSchedule,
    pub effects: Vec<EffectCue>,
    pub success_probability: f32,
    pub compatibility: Option<CompatibilityScore>,
    pub beatmatch: Option<BeatmatchPlan>,
    pub fallback_reason: Option<FallbackReason>,
}

impl TransitionPlan {
    pub fn is_fallback(&self) -> bool {
        self.style == TransitionStyle::Fallback
    }

    /// Time from transition start to the last automation step.
    pub fn total_ms(&self) -> u64 {
        let fx_end = self.effects.iter().map(|c| c.offset_ms).max().unwrap_or(0);
        self.stem_schedule.total_ms().max(fx_end).max(self.duration_ms)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            outgoing_track: self.outgoing_track.clone(),
            incoming_track: self.incoming_track.clone(),
            style: self.style,
            exit_seconds: self.exit_point.time_seconds,
            exit_kind: self.exit_point.kind,
            entry_seconds: self.entry_point.time_seconds,
            entry_kind: self.entry_point.kind,
            duration_ms: self.duration_ms,
            phases: self.stem_schedule.len(),
            success_probability: self.success_probability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub outgoing_track: String,
    pub incoming_track: Option<String>,
    pub style: TransitionStyle,
    pub exit_seconds: f64,
    pub exit_kind: TimePointKind,
    pub entry_seconds: f64,
    pub entry_kind: TimePointKind,
    pub duration_ms: u64,
    pub phases: usize,
    pub success_probability: f32,
}

// ── Planner ─────────────────────────────────────────────────────────────────

const PHRASE_SCORE: u8 = 6;
const SECTION_SCORE: u8 = 5;
const VOCAL_SCORE: u8 = 4;
const CUE_OUT_SCORE: u8 = 3;
const BAR_GROUP_SCORE: u8 = 2;
const DOWNBEAT_SCORE: u8 = 1;
const IMMEDIATE_SCORE: u8 = 0;

const BARS_PER_GROUP: u32 = 4;

const HIGH_ENERGY_FRACTION: f64 = 0.2;
const HIGH_ENERGY_MAX_SECS: f64 = 30.0;
const BREAKDOWN_FRACTION: f64 = 0.6;

pub struct TransitionPlanner {
    config: PlannerConfig,
    evaluator: CompatibilityEvaluator,
    state: PlannerState,
}

impl TransitionPlanner {
    pub fn new(config: PlannerConfig, evaluator: CompatibilityEvaluator) -> Self {
        Self {
            config,
            evaluator,
            state: PlannerState::Idle,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &CompatibilityEvaluator {
        &self.evaluator
    }

    /// Where the last attempt ended up (`Ready` or `Fallback`).
    pub fn state(&self) -> PlannerState {
        self.state
    }

    fn enter(&mut self, state: PlannerState) {
        log::debug!("Planner {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Plan a transition out of `current` at `position`.
    ///
    /// Always returns a plan. When nothing musical fits, the plan has style
    /// [`TransitionStyle::Fallback`], an empty schedule and a success
    /// probability below `min_viable_probability`.
    pub fn plan(
        &mut self,
        current: &TrackAnalysis,
        position: f64,
        next: Option<&TrackAnalysis>,
        mode: SearchMode,
    ) -> TransitionPlan {
        self.state = PlannerState::Idle;
        self.enter(PlannerState::SearchingExit);
        let exit = self.find_exit_point(current, position, mode);

        let Some(next) = next else {
            let exit = exit.unwrap_or_else(|| immediate(position));
            return self.fallback(current, None, exit, start_point(), FallbackReason::NoNextTrack, 0.0);
        };
        let Some(exit) = exit else {
            return self.fallback(
                current,
                Some(next),
                immediate(position),
                start_point(),
                FallbackReason::NoExitPoint,
                0.0,
            );
        };

        self.enter(PlannerState::SearchingEntry);
        let wanted = EnergyClass::implied_by(exit.kind);
        let (entry, entry_class) = find_entry_point(next, wanted);

        self.enter(PlannerState::StyleSelection);
        let compatibility = self.evaluator.evaluate(current, next);
        let (style, secs) = self.select_style(exit.kind, entry_class, compatibility.overall_compatible);
        let remaining = (current.duration_seconds - exit.time_seconds).max(0.0);
        let duration_ms = (secs.min(remaining) * 1000.0).round() as u64;

        let probability = success_probability(&compatibility, exit.kind);
        let thresholds = self.evaluator.config();
        let clashing = compatibility.tempo_delta_bpm > thresholds.max_tempo_delta_bpm
            && compatibility.harmonic_score < thresholds.min_harmonic_score;
        if clashing || probability < self.config.min_viable_probability {
            log::warn!(
                "No viable plan {} -> {} (p={probability:.2}), falling back",
                current.track_id,
                next.track_id
            );
            return self.fallback(current, Some(next), exit, entry, FallbackReason::LowProbability, probability);
        }

        self.enter(PlannerState::PhaseScheduling);
        let built = match style {
            TransitionStyle::HardCut => StemSchedule::hard_cut(),
            _ => StemSchedule::staged_handover(duration_ms, self.config.phase_spacing),
        };
        let stem_schedule = match built {
            Ok(schedule) => schedule,
            Err(e) => {
                log::warn!("Rejected {style:?} schedule for {}: {e}", current.track_id);
                return self.fallback(current, Some(next), exit, entry, FallbackReason::InvalidSchedule, probability);
            }
        };
        let effects = self.effect_cues(style, &compatibility, current, duration_ms);

        self.enter(PlannerState::Ready);
        let plan = TransitionPlan {
            outgoing_track: current.track_id.clone(),
            incoming_track: Some(next.track_id.clone()),
            exit_point: exit,
            entry_point: entry,
            style,
            duration_ms,
            stem_schedule,
            effects,
            success_probability: probability,
            beatmatch: Some(beatmatch(current.tempo_bpm, next.tempo_bpm)),
            compatibility: Some(compatibility),
            fallback_reason: None,
        };
        log::info!(
            "Planned {:?} {} -> {} at {:.2}s (entry {:.2}s, {} ms, p={:.2})",
            plan.style,
            plan.outgoing_track,
            next.track_id,
            plan.exit_point.time_seconds,
            plan.entry_point.time_seconds,
            plan.duration_ms,
            plan.success_probability
        );
        plan
    }

    /// Best exit point inside the look-ahead window, or an emergency exit at
    /// `position` when the track is about to end. `None` means wait.
    pub fn find_exit_point(&self, track: &TrackAnalysis, position: f64, mode: SearchMode) -> Option<TimePoint> {
        let window = match mode {
            SearchMode::Auto => self.config.look_ahead_secs,
            SearchMode::Quick => self.config.quick_look_ahead_secs,
        };
        let start = position.max(0.0);
        let end = (start + window).min(track.duration_seconds);
        let in_window = |t: f64| t >= start && t <= end;
        let half_beat = track.beat_interval() / 2.0;

        let mut candidates: Vec<(u8, TimePoint)> = Vec::new();

        let boundaries: Vec<f64> = track.sections.iter().skip(1).map(|s| s.start_seconds).collect();
        for beat in track.beats_between(start, end).filter(|b| b.is_phrase_start) {
            let t = beat.time_seconds;
            let on_boundary = beat.is_section_start || boundaries.iter().any(|b| (b - t).abs() <= half_beat);
            let point = if on_boundary {
                TimePoint::new(t, TimePointKind::SectionBoundary, format!("section start, bar {}", beat.bar_number))
            } else {
                TimePoint::new(t, TimePointKind::PhraseStart, format!("phrase start, bar {}", beat.bar_number))
            };
            candidates.push((PHRASE_SCORE, point));
        }

        for section in track.sections.iter().skip(1) {
            let t = track.nearest_beat(section.start_seconds).unwrap_or(section.start_seconds);
            if in_window(t) {
                candidates.push((
                    SECTION_SCORE,
                    TimePoint::new(t, TimePointKind::SectionBoundary, format!("{:?} begins", section.kind)),
                ));
            }
        }

        for v in track.vocal_activity.transitions() {
            let t = track.nearest_beat(v).unwrap_or(v);
            if in_window(t) {
                candidates.push((VOCAL_SCORE, TimePoint::new(t, TimePointKind::VocalTransition, "vocal change")));
            }
        }

        let cue_out = track.cue_points.cue_out_seconds;
        if in_window(cue_out) {
            candidates.push((CUE_OUT_SCORE, TimePoint::new(cue_out, TimePointKind::CueOut, "cue out")));
        }

        // Auto mode falls back to bar-level grid points.
        if mode == SearchMode::Auto {
            let bar_group = track
                .beats_between(start, end)
                .find(|b| b.is_downbeat && (b.bar_number - 1) % BARS_PER_GROUP == 0);
            if let Some(b) = bar_group {
                candidates.push((
                    BAR_GROUP_SCORE,
                    TimePoint::new(b.time_seconds, TimePointKind::BarGroup, format!("bar {}", b.bar_number)),
                ));
            }
            if let Some(b) = track.beats_between(start, end).find(|b| b.is_downbeat) {
                candidates.push((
                    DOWNBEAT_SCORE,
                    TimePoint::new(b.time_seconds, TimePointKind::Downbeat, format!("downbeat, bar {}", b.bar_number)),
                ));
            }
        }

        if mode == SearchMode::Quick {
            if let Some(b) = track
                .beats_between(start, end)
                .find(|b| b.is_downbeat)
                .or_else(|| track.beats_between(start, end).next())
            {
                candidates.push((
                    IMMEDIATE_SCORE,
                    TimePoint::new(b.time_seconds, TimePointKind::Immediate, "next downbeat"),
                ));
            }
        }

        let best = candidates
            .into_iter()
            .reduce(|best, c| {
                let better = c.0 > best.0 || (c.0 == best.0 && c.1.time_seconds < best.1.time_seconds);
                if better {
                    c
                } else {
                    best
                }
            })
            .map(|(_, p)| p);
        if best.is_some() {
            return best;
        }

        let remaining = track.duration_seconds - start;
        if remaining <= self.config.emergency_remaining_secs {
            log::warn!("No exit point for {} with {remaining:.1}s left, forcing emergency exit", track.track_id);
            return Some(TimePoint::new(start, TimePointKind::Emergency, "track ending"));
        }
        None
    }

    /// Rule table: exit kind and entry energy → style and nominal duration.
    pub fn select_style(
        &self,
        exit: TimePointKind,
        entry: EnergyClass,
        compatible: bool,
    ) -> (TransitionStyle, f64) {
        let c = &self.config;
        match exit {
            TimePointKind::SectionBoundary if entry == EnergyClass::High => (TransitionStyle::HardCut, 0.0),
            TimePointKind::VocalTransition => (TransitionStyle::StemTransition, c.stem_transition_secs),
            TimePointKind::PhraseStart => (TransitionStyle::EchoTransition, c.echo_secs),
            TimePointKind::Emergency => (TransitionStyle::Emergency, c.emergency_secs),
            _ => {
                let base = if exit == TimePointKind::SectionBoundary {
                    c.section_crossfade_secs
                } else {
                    c.crossfade_secs
                };
                let secs = if compatible { base } else { (base / 2.0).max(c.emergency_secs) };
                (TransitionStyle::AdaptiveCrossfade, secs)
            }
        }
    }

    fn effect_cues(
        &self,
        style: TransitionStyle,
        compatibility: &CompatibilityScore,
        current: &TrackAnalysis,
        duration_ms: u64,
    ) -> Vec<EffectCue> {
        let beat = current.beat_interval();
        match style {
            TransitionStyle::EchoTransition => vec![
                EffectCue {
                    role: DeckRole::Outgoing,
                    offset_ms: 0,
                    change: FxChange::Echo(Some(EchoSettings {
                        // An eighth note.
                        delay_secs: (beat / 2.0) as f32,
                        ..EchoSettings::default()
                    })),
                },
            ],
            TransitionStyle::HardCut
                if !matches!(compatibility.tempo_class, TempoClass::Perfect | TempoClass::Good) =>
            {
                let bar_ms = (beat * 4000.0).round() as u64;
                vec![
                    EffectCue {
                        role: DeckRole::Outgoing,
                        offset_ms: 0,
                        change: FxChange::Filter(FilterState::HighPass { cutoff_hz: 1000.0 }),
                    },
                    EffectCue {
                        role: DeckRole::Incoming,
                        offset_ms: 0,
                        change: FxChange::Filter(FilterState::LowPass { cutoff_hz: 800.0 }),
                    },
                    EffectCue {
                        role: DeckRole::Incoming,
                        offset_ms: bar_ms,
                        change: FxChange::Filter(FilterState::Bypass),
                    },
                ]
            }
            TransitionStyle::AdaptiveCrossfade if !compatibility.overall_compatible => vec![EffectCue {
                role: DeckRole::Outgoing,
                offset_ms: duration_ms / 4,
                change: FxChange::Filter(FilterState::HighPass {
                    cutoff_hz: self.config.clash_low_cut_hz,
                }),
            }],
            _ => Vec::new(),
        }
    }

    fn fallback(
        &mut self,
        current: &TrackAnalysis,
        next: Option<&TrackAnalysis>,
        exit: TimePoint,
        entry: TimePoint,
        reason: FallbackReason,
        probability: f32,
    ) -> TransitionPlan {
        self.enter(PlannerState::Fallback);
        let remaining = (current.duration_seconds - exit.time_seconds).max(0.0);
        let duration_ms = (self.config.fallback_crossfade_secs.min(remaining) * 1000.0).round() as u64;
        let probability = probability.min(self.config.min_viable_probability - f32::EPSILON).max(0.0);
        log::debug!("Fallback plan for {} ({reason:?})", current.track_id);
        TransitionPlan {
            outgoing_track: current.track_id.clone(),
            incoming_track: next.map(|n| n.track_id.clone()),
            exit_point: exit,
            entry_point: entry,
            style: TransitionStyle::Fallback,
            duration_ms,
            stem_schedule: StemSchedule::empty(),
            effects: Vec::new(),
            success_probability: probability,
            compatibility: next.map(|n| self.evaluator.evaluate(current, n)),
            beatmatch: next.map(|n| beatmatch(current.tempo_bpm, n.tempo_bpm)),
            fallback_reason: Some(reason),
        }
    }
}

/// Best entry candidate for the wanted energy; ties go to the earliest.
pub fn find_entry_point(track: &TrackAnalysis, wanted: EnergyClass) -> (TimePoint, EnergyClass) {
    let duration = track.duration_seconds;
    let snap = |t: f64| track.nearest_downbeat(t).unwrap_or(t);

    let mut candidates = vec![start_point()];
    if let Some(t) = track.vocal_activity.first_entry() {
        candidates.push(TimePoint::new(snap(t), TimePointKind::VocalEntry, "first vocal entry"));
    }

    let high = track
        .sections
        .iter()
        .find(|s| s.kind != SectionKind::Intro && EnergyClass::from_level(s.average_energy) == EnergyClass::High)
        .map(|s| s.start_seconds)
        .unwrap_or_else(|| (duration * HIGH_ENERGY_FRACTION).min(HIGH_ENERGY_MAX_SECS));
    candidates.push(TimePoint::new(snap(high), TimePointKind::HighEnergy, "first high-energy section"));

    let breakdown = track
        .sections
        .iter()
        .find(|s| s.kind == SectionKind::Breakdown)
        .map(|s| s.start_seconds)
        .unwrap_or(duration * BREAKDOWN_FRACTION);
    candidates.push(TimePoint::new(snap(breakdown), TimePointKind::Breakdown, "breakdown"));

    candidates.retain(|c| c.time_seconds >= 0.0 && (c.time_seconds < duration || duration <= 0.0));
    candidates.sort_by(|a, b| a.time_seconds.total_cmp(&b.time_seconds));

    let class_at = |t: f64| {
        track
            .section_at(t)
            .map(|s| EnergyClass::from_level(s.average_energy))
            .unwrap_or(EnergyClass::Variable)
    };

    let mut best: Option<(f32, TimePoint, EnergyClass)> = None;
    for c in candidates {
        let class = class_at(c.time_seconds);
        let score = EnergyClass::match_score(wanted, class);
        if best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
            best = Some((score, c, class));
        }
    }
    best.map(|(_, p, c)| (p, c))
        .unwrap_or_else(|| (start_point(), EnergyClass::Variable))
}

/// Blend of tempo and harmonic fit, adjusted for exit timing and tempo class.
pub fn success_probability(compat: &CompatibilityScore, exit: TimePointKind) -> f32 {
    let base = (compat.tempo_class.score() + compat.harmonic_score) / 2.0;
    let timing = match exit {
        TimePointKind::PhraseStart
        | TimePointKind::SectionBoundary
        | TimePointKind::BarGroup
        | TimePointKind::Downbeat => 0.1,
        TimePointKind::Emergency => -0.1,
        _ => 0.0,
    };
    (base + timing + compat.tempo_class.probability_bonus()).clamp(0.0, 1.0)
}

fn start_point() -> TimePoint {
    TimePoint::new(0.0, TimePointKind::TrackStart, "track start")
}

fn immediate(position: f64) -> TimePoint {
    TimePoint::new(position.max(0.0), TimePointKind::Immediate, "current position")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analyzer::{
        beatgrid, AnalysisConfig, CuePoints, EnergyCurve, KeyMode, MusicalKey, Section, TrackAnalyzer,
        VocalActivity, VocalSegment,
    };
    use crate::scheduler::compatibility::HarmonicRelation;

    /// Synthetic analysis: grid from `first_beat`, positional sections, no vocals.
    fn track(id: &str, bpm: f64, duration: f64, first_beat: f64, key: MusicalKey) -> TrackAnalysis {
        let energy = EnergyCurve::flat(duration, 1.0, 0.8);
        let period = 60.0 / bpm;
        let onsets: Vec<_> = (0..)
            .map(|i| first_beat + i as f64 * period)
            .take_while(|t| *t < duration)
            .map(|t| crate::audio::analyzer::tempo::Onset { time_seconds: t, strength: 1.0 })
            .collect();
        let beat_grid = beatgrid::build_beat_grid(bpm, duration, &onsets, &energy);
        let sections = crate::audio::analyzer::structure::segment(
            &energy,
            &beat_grid,
            duration,
            &AnalysisConfig::default(),
        );
        TrackAnalysis {
            track_id: id.to_string(),
            tempo_bpm: bpm,
            tempo_confidence: 0.9,
            key,
            beat_grid,
            sections,
            duration_seconds: duration,
            energy_curve: energy,
            vocal_activity: VocalActivity::silent(duration, 0.5),
            cue_points: CuePoints {
                cue_in_seconds: 0.0,
                cue_out_seconds: duration * 0.85,
            },
            is_fallback: false,
        }
    }

    fn planner() -> TransitionPlanner {
        TransitionPlanner::new(PlannerConfig::default(), CompatibilityEvaluator::default())
    }

    fn c_major() -> MusicalKey {
        MusicalKey::new(0, KeyMode::Major, 0.9)
    }

    #[test]
    fn compatible_pair_near_end_with_grid_from_zero() {
        // Phrases land on 165 and 180; the four-bar grid gives 172.5.
        let a = track("a", 128.0, 180.0, 0.0, c_major());
        let b = track("b", 128.0, 200.0, 0.0, MusicalKey::new(9, KeyMode::Minor, 0.9));
        let mut p = planner();
        let plan = p.plan(&a, 170.0, Some(&b), SearchMode::Auto);

        assert_eq!(p.state(), PlannerState::Ready);
        assert_eq!(plan.fallback_reason, None);
        assert_eq!(plan.exit_point.kind, TimePointKind::BarGroup);
        assert!((plan.exit_point.time_seconds - 172.5).abs() < 1e-9, "{:?}", plan.exit_point);
        assert!(plan.success_probability > 0.7);
        assert!(plan.compatibility.as_ref().unwrap().overall_compatible);
        assert_eq!(plan.style, TransitionStyle::AdaptiveCrossfade);
        assert_eq!(plan.duration_ms, 7500);
        assert!(!plan.stem_schedule.is_empty());
    }

    #[test]
    fn bar_groups_outrank_plain_downbeats() {
        let a = track("a", 128.0, 180.0, 0.0, c_major());
        let p = planner();
        // Bars 91 (168.75) and 92 (170.625) come before bar 93 at 172.5.
        let exit = p.find_exit_point(&a, 168.0, SearchMode::Auto).unwrap();
        assert_eq!(exit.kind, TimePointKind::BarGroup);
        assert!((exit.time_seconds - 172.5).abs() < 1e-9);

        let mut plain = a.clone();
        plain.beat_grid.retain(|b| b.time_seconds < 172.0);
        let exit = p.find_exit_point(&plain, 170.0, SearchMode::Auto).unwrap();
        assert_eq!(exit.kind, TimePointKind::Downbeat);
        assert!((exit.time_seconds - 170.625).abs() < 1e-9);
    }

    #[test]
    fn half_time_pair_on_opposite_keys_falls_back() {
        let a = track("a", 80.0, 180.0, 0.0, c_major());
        let b = track("b", 160.0, 200.0, 0.0, MusicalKey::new(3, KeyMode::Minor, 0.9));
        assert_eq!((a.key.wheel.code().as_str(), b.key.wheel.code().as_str()), ("8B", "2A"));
        let mut p = planner();
        let plan = p.plan(&a, 140.0, Some(&b), SearchMode::Auto);

        let compat = plan.compatibility.as_ref().unwrap();
        assert_eq!(compat.tempo_class, TempoClass::HalfTime);
        assert!(!compat.overall_compatible);
        assert_eq!(plan.style, TransitionStyle::Fallback);
        assert_eq!(plan.fallback_reason, Some(FallbackReason::LowProbability));
        assert!(plan.success_probability < 0.3);
        assert!(plan.stem_schedule.is_empty());
    }

    #[test]
    fn planned_schedules_pass_validation() {
        let a = track("a", 128.0, 180.0, 0.0, c_major());
        let b = track("b", 128.0, 200.0, 0.0, MusicalKey::new(9, KeyMode::Minor, 0.9));
        let mut p = planner();
        let mut pos = 140.0;
        while pos < 180.0 {
            for mode in [SearchMode::Auto, SearchMode::Quick] {
                let plan = p.plan(&a, pos, Some(&b), mode);
                assert_ne!(plan.fallback_reason, Some(FallbackReason::InvalidSchedule));
                let phases = plan.stem_schedule.phases().to_vec();
                assert_eq!(StemSchedule::new(phases).as_ref(), Ok(&plan.stem_schedule), "{pos} {mode:?}");
            }
            pos += 2.3;
        }
    }

    #[test]
    fn phrase_start_in_window_gives_echo_transition() {
        let a = track("a", 128.0, 180.0, 8.0, c_major());
        let b = track("b", 128.0, 200.0, 0.5, MusicalKey::new(9, KeyMode::Minor, 0.9));
        let mut p = planner();
        let plan = p.plan(&a, 170.0, Some(&b), SearchMode::Auto);

        assert_eq!(p.state(), PlannerState::Ready);
        assert!((172.0..=176.0).contains(&plan.exit_point.time_seconds), "{:?}", plan.exit_point);
        assert_eq!(plan.exit_point.kind, TimePointKind::PhraseStart);
        assert_eq!(plan.style, TransitionStyle::EchoTransition);
        assert!(plan.success_probability > 0.7);
        let compat = plan.compatibility.as_ref().unwrap();
        assert_eq!(compat.harmonic_reason, HarmonicRelation::Relative);
        assert!(compat.overall_compatible);
        assert_eq!(plan.duration_ms, 4000);
        assert!(matches!(plan.effects[0].change, FxChange::Echo(Some(_))));
    }

    #[test]
    fn clashing_pair_still_returns_a_plan() {
        let a = track("a", 100.0, 180.0, 0.0, c_major());
        // 2A sits opposite 8B.
        let b = track("b", 180.0, 200.0, 0.0, MusicalKey::new(3, KeyMode::Minor, 0.9));
        assert_eq!(b.key.wheel.code(), "2A");
        let mut p = planner();
        let plan = p.plan(&a, 170.0, Some(&b), SearchMode::Auto);
        assert!(plan.success_probability < 0.3);
        assert!(matches!(plan.style, TransitionStyle::Fallback | TransitionStyle::Emergency));
        assert_eq!(p.state(), PlannerState::Fallback);
        assert!(plan.stem_schedule.is_empty());
    }

    #[test]
    fn far_tempos_terminate_with_usable_plan() {
        let a = track("a", 90.0, 180.0, 0.0, c_major());
        let b = TrackAnalyzer::default().fallback("b", 240.0);
        let mut p = planner();
        for pos in [150.0, 165.0, 172.0, 179.5] {
            let plan = p.plan(&a, pos, Some(&b), SearchMode::Auto);
            assert!(plan.exit_point.time_seconds >= pos);
            assert!(plan.exit_point.time_seconds <= pos + 16.0);
        }
        let no_next = p.plan(&a, 170.0, None, SearchMode::Auto);
        assert_eq!(no_next.fallback_reason, Some(FallbackReason::NoNextTrack));
        assert_eq!(no_next.success_probability, 0.0);
    }

    #[test]
    fn exit_search_stays_inside_window() {
        let a = track("a", 128.0, 300.0, 0.3, c_major());
        let p = planner();
        let mut pos = 0.0;
        while pos < 300.0 {
            for mode in [SearchMode::Auto, SearchMode::Quick] {
                let window = if mode == SearchMode::Auto { 16.0 } else { 4.0 };
                if let Some(exit) = p.find_exit_point(&a, pos, mode) {
                    assert!(exit.time_seconds >= pos, "{pos} {exit:?}");
                    assert!(exit.time_seconds <= pos + window, "{pos} {exit:?}");
                }
            }
            pos += 3.7;
        }
    }

    #[test]
    fn nothing_in_window_far_from_end_waits() {
        let mut a = track("a", 128.0, 300.0, 0.0, c_major());
        a.cue_points.cue_out_seconds = 250.0;
        // Phrases every 15 s from zero; 76..80 holds none.
        let p = planner();
        assert!(p.find_exit_point(&a, 76.0, SearchMode::Quick).map(|e| e.kind) == Some(TimePointKind::Immediate));
        let window_with_no_phrase = p.find_exit_point(&a, 61.0, SearchMode::Auto);
        assert_eq!(window_with_no_phrase.map(|e| e.kind), Some(TimePointKind::PhraseStart));

        let mut sparse = a.clone();
        sparse.beat_grid.retain(|b| b.time_seconds < 100.0);
        assert!(p.find_exit_point(&sparse, 150.0, SearchMode::Auto).is_none());
        let emergency = p.find_exit_point(&sparse, 293.0, SearchMode::Auto).unwrap();
        assert_eq!(emergency.kind, TimePointKind::Emergency);
        assert_eq!(emergency.time_seconds, 293.0);
    }

    #[test]
    fn vocal_transitions_outrank_cue_out() {
        let mut a = track("a", 120.0, 200.0, 0.25, c_major());
        a.vocal_activity.segments = vec![VocalSegment { start_seconds: 100.0, end_seconds: 146.3 }];
        a.cue_points.cue_out_seconds = 150.0;
        let p = planner();
        // Phrase starts at 0.25 + 16k: 144.25 wins over the vocal end at 146.25.
        let exit = p.find_exit_point(&a, 140.0, SearchMode::Auto).unwrap();
        assert_eq!(exit.kind, TimePointKind::PhraseStart);
        assert!((exit.time_seconds - 144.25).abs() < 1e-9);

        a.beat_grid.iter_mut().for_each(|b| b.is_phrase_start = false);
        let exit = p.find_exit_point(&a, 140.0, SearchMode::Auto).unwrap();
        assert_eq!(exit.kind, TimePointKind::VocalTransition);
        assert!((exit.time_seconds - 146.25).abs() < 1e-9);
    }

    #[test]
    fn style_table() {
        let p = planner();
        assert_eq!(
            p.select_style(TimePointKind::SectionBoundary, EnergyClass::High, true),
            (TransitionStyle::HardCut, 0.0)
        );
        assert_eq!(
            p.select_style(TimePointKind::SectionBoundary, EnergyClass::Low, true),
            (TransitionStyle::AdaptiveCrossfade, 2.0)
        );
        assert_eq!(
            p.select_style(TimePointKind::VocalTransition, EnergyClass::Low, true).0,
            TransitionStyle::StemTransition
        );
        assert_eq!(
            p.select_style(TimePointKind::PhraseStart, EnergyClass::Medium, false),
            (TransitionStyle::EchoTransition, 4.0)
        );
        assert_eq!(
            p.select_style(TimePointKind::Emergency, EnergyClass::Variable, true),
            (TransitionStyle::Emergency, 1.0)
        );
        assert_eq!(
            p.select_style(TimePointKind::CueOut, EnergyClass::Low, false),
            (TransitionStyle::AdaptiveCrossfade, 4.0)
        );
    }

    #[test]
    fn entry_matches_energy_class() {
        let mut b = track("b", 120.0, 200.0, 0.0, c_major());
        b.sections = vec![
            Section { kind: SectionKind::Intro, start_seconds: 0.0, end_seconds: 40.0, average_energy: 0.2 },
            Section { kind: SectionKind::Chorus, start_seconds: 40.0, end_seconds: 120.0, average_energy: 0.9 },
            Section { kind: SectionKind::Breakdown, start_seconds: 120.0, end_seconds: 170.0, average_energy: 0.5 },
            Section { kind: SectionKind::Outro, start_seconds: 170.0, end_seconds: 200.0, average_energy: 0.3 },
        ];
        let (high, class) = find_entry_point(&b, EnergyClass::High);
        assert_eq!(high.kind, TimePointKind::HighEnergy);
        assert_eq!(high.time_seconds, 40.0);
        assert_eq!(class, EnergyClass::High);

        let (low, _) = find_entry_point(&b, EnergyClass::Low);
        assert_eq!(low.kind, TimePointKind::TrackStart);

        let (mid, class) = find_entry_point(&b, EnergyClass::Medium);
        assert_eq!(mid.kind, TimePointKind::Breakdown);
        assert_eq!(mid.time_seconds, 120.0);
        assert_eq!(class, EnergyClass::Medium);

        let (any, _) = find_entry_point(&b, EnergyClass::Variable);
        assert_eq!(any.time_seconds, 0.0);
    }

    #[test]
    fn probability_bonuses() {
        let eval = CompatibilityEvaluator::default();
        let key = c_major();
        let perfect = eval.score(128.0, &key.wheel, 128.0, &key.wheel);
        assert_eq!(success_probability(&perfect, TimePointKind::PhraseStart), 1.0);
        let p = success_probability(&perfect, TimePointKind::Emergency);
        assert!((p - 1.0).abs() < 1e-6);
        let poor = eval.score(90.0, &key.wheel, 130.0, &key.wheel);
        let p = success_probability(&poor, TimePointKind::CueOut);
        assert!((p - 0.45).abs() < 1e-6, "{p}");
    }

    #[test]
    fn summary_mirrors_plan() {
        let a = track("a", 128.0, 180.0, 8.0, c_major());
        let b = track("b", 128.0, 200.0, 0.5, c_major());
        let plan = planner().plan(&a, 170.0, Some(&b), SearchMode::Auto);
        let s = plan.summary();
        assert_eq!(s.style, plan.style);
        assert_eq!(s.phases, plan.stem_schedule.len());
        assert_eq!(s.incoming_track.as_deref(), Some("b"));
    }
}
