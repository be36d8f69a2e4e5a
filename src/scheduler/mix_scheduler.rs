use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    events::{EventBus, MixEvent},
    stem_schedule::{StemSchedule, StemTarget},
    transition_planner::{DeckRole, TransitionPlan},
};
use crate::{
    audio::{
        clock::AudioClock,
        deck::{DeckId, DeckState, PlaybackState},
        dsp::FxChange,
        engine::{AudioGraph, GraphCmd, RenderHandle},
        stems::{Stem, StemSet},
    },
    error::{ConflictReason, MixError, MixResult},
};

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How far ahead of the audio clock automation is handed to the graph.
    pub lookahead_ms: u64,
    /// Minimum gap between `execute` and the incoming deck's start.
    pub start_lead_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 100,
            start_lead_ms: 50,
        }
    }
}

// ── In-flight transition ────────────────────────────────────────────────────

/// A phase resolved to absolute audio-clock seconds.
struct ClockPhase {
    at: f64,
    ramp_secs: f64,
    per_stem: Vec<(Stem, StemTarget)>,
}

struct ClockFx {
    deck: DeckId,
    at: f64,
    change: FxChange,
}

struct ActiveTransition {
    outgoing: DeckId,
    incoming: DeckId,
    start: f64,
    end: f64,
    phases: Vec<ClockPhase>,
    next_phase: usize,
    effects: Vec<ClockFx>,
    next_fx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Idle,
    InProgress { progress: f32 },
    Completed { new_main: DeckId },
}

// ── MixScheduler ────────────────────────────────────────────────────────────

/// Executes [`TransitionPlan`]s against the [`AudioGraph`].
///
/// Every automation endpoint is computed from one clock snapshot taken in
/// [`execute`](Self::execute). [`tick`](Self::tick) only decides *when* to hand
/// already-anchored commands to the graph.
pub struct MixScheduler {
    config: SchedulerConfig,
    graph: AudioGraph,
    main: DeckId,
    active: Option<ActiveTransition>,
    events: EventBus,
}

impl MixScheduler {
    pub fn new(config: SchedulerConfig, graph: AudioGraph, events: EventBus) -> Self {
        Self {
            config,
            graph,
            main: DeckId::DeckA,
            active: None,
            events,
        }
    }

    pub fn main_deck(&self) -> DeckId {
        self.main
    }

    pub fn is_in_flight(&self) -> bool {
        self.active.is_some()
    }

    pub fn now(&self) -> f64 {
        self.graph.clock().now()
    }

    pub fn render_handle(&self) -> RenderHandle {
        self.graph.render_handle()
    }

    pub fn deck_state(&self, deck: DeckId) -> DeckState {
        self.graph.deck_state(deck)
    }

    pub fn main_state(&self) -> DeckState {
        self.graph.deck_state(self.main)
    }

    pub fn main_position(&self) -> f64 {
        self.graph.position(self.main)
    }

    pub fn master_peak_db(&self) -> f32 {
        self.graph.master_peak_db()
    }

    /// Put a track on the main deck at full volume, starting now.
    pub fn load_main(&mut self, stems: Arc<StemSet>) -> MixResult<()> {
        if self.active.is_some() {
            return Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight));
        }
        let now = self.now();
        let deck = self.main;
        log::info!("Loading {} on {deck}", stems.track_id);
        self.graph.flush();
        self.graph.send(GraphCmd::Load { deck, stems })?;
        self.graph.send(GraphCmd::Reset { deck, stem_volume: 1.0, deck_gain: 1.0 })?;
        self.graph.send(GraphCmd::Start { deck, at: now, track_secs: 0.0 })
    }

    /// Apply an effect change to a deck right away.
    pub fn apply_effect(&mut self, deck: DeckId, change: FxChange) -> MixResult<()> {
        let at = self.now();
        self.graph.send(GraphCmd::Fx { deck, at, change })
    }

    /// Start executing `plan`, with `incoming` loaded on the idle deck.
    ///
    /// Rejected without touching either deck when a transition is already in
    /// flight or the main deck has nothing loaded. An empty schedule is
    /// replaced by a full-mix crossfade over the plan's duration.
    pub fn execute(&mut self, plan: &TransitionPlan, incoming_stems: Arc<StemSet>) -> MixResult<()> {
        if self.active.is_some() {
            return Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight));
        }
        self.graph.flush();
        let outgoing = self.main;
        let main_state = self.graph.deck_state(outgoing);
        if main_state.playback == PlaybackState::Idle {
            return Err(MixError::SchedulingConflict(ConflictReason::NothingPlaying));
        }
        let incoming = outgoing.other();

        // Single snapshot; everything below is relative to `start`.
        let now = self.now();
        let lead = self.config.start_lead_ms as f64 / 1000.0;
        let until_exit = plan.exit_point.time_seconds - main_state.position_seconds;
        let start = now + until_exit.max(lead);

        let fallback_schedule;
        let schedule = if plan.stem_schedule.is_empty() {
            fallback_schedule = StemSchedule::full_mix_crossfade(plan.duration_ms)?;
            &fallback_schedule
        } else {
            &plan.stem_schedule
        };

        let phases: Vec<ClockPhase> = schedule
            .phases()
            .iter()
            .map(|p| ClockPhase {
                at: start + p.offset_ms as f64 / 1000.0,
                ramp_secs: p.ramp_ms as f64 / 1000.0,
                per_stem: p.per_stem.iter().map(|(s, t)| (*s, *t)).collect(),
            })
            .collect();
        let mut effects: Vec<ClockFx> = plan
            .effects
            .iter()
            .map(|cue| ClockFx {
                deck: match cue.role {
                    DeckRole::Outgoing => outgoing,
                    DeckRole::Incoming => incoming,
                },
                at: start + cue.offset_ms as f64 / 1000.0,
                change: cue.change,
            })
            .collect();
        effects.sort_by(|a, b| a.at.total_cmp(&b.at));

        let automation_end = phases
            .iter()
            .map(|p| p.at + p.ramp_secs)
            .chain(effects.iter().map(|e| e.at))
            .fold(start, f64::max);
        let end = automation_end.max(start + plan.duration_ms as f64 / 1000.0);

        let incoming_track = incoming_stems.track_id.clone();
        let begin = [
            GraphCmd::Load { deck: incoming, stems: incoming_stems },
            GraphCmd::Start {
                deck: incoming,
                at: start,
                track_secs: plan.entry_point.time_seconds,
            },
        ];
        for cmd in begin {
            if let Err(e) = self.graph.send(cmd) {
                self.restore(outgoing);
                return Err(e);
            }
        }

        log::info!(
            "Transition {outgoing} -> {incoming} ({:?}) at clock {start:.3}s, ends {end:.3}s",
            plan.style
        );
        self.events.emit(MixEvent::TransitionStarted {
            outgoing,
            incoming,
            outgoing_track: plan.outgoing_track.clone(),
            incoming_track,
        });
        self.active = Some(ActiveTransition {
            outgoing,
            incoming,
            start,
            end,
            phases,
            next_phase: 0,
            effects,
            next_fx: 0,
        });
        // Phases at offset zero may already be inside the look-ahead.
        self.issue_due();
        Ok(())
    }

    /// Hand due automation to the graph and complete the transition once its
    /// last ramp has finished.
    pub fn tick(&mut self) -> TickOutcome {
        let Some(active) = &self.active else {
            return TickOutcome::Idle;
        };
        let (start, end) = (active.start, active.end);
        self.issue_due();

        let now = self.now();
        let all_issued = self
            .active
            .as_ref()
            .map(|a| a.next_phase >= a.phases.len() && a.next_fx >= a.effects.len())
            .unwrap_or(true);
        if now >= end && all_issued {
            return match self.complete() {
                Some(new_main) => TickOutcome::Completed { new_main },
                None => TickOutcome::Idle,
            };
        }
        let span = (end - start).max(f64::EPSILON);
        TickOutcome::InProgress {
            progress: ((now - start) / span).clamp(0.0, 1.0) as f32,
        }
    }

    /// Swap main-deck ownership, silence and release the old deck.
    /// Returns the new main deck, or `None` when nothing was in flight.
    pub fn complete(&mut self) -> Option<DeckId> {
        let active = self.active.take()?;
        self.graph.flush();
        self.main = active.incoming;
        let old = active.outgoing;
        for cmd in [
            GraphCmd::Reset { deck: old, stem_volume: 0.0, deck_gain: 0.0 },
            GraphCmd::Unload { deck: old },
        ] {
            if let Err(e) = self.graph.send(cmd) {
                log::warn!("Releasing {old} failed: {e}");
            }
        }
        self.graph.flush();
        log::info!("Transition complete, main deck is now {}", self.main);
        self.events.emit(MixEvent::TransitionCompleted {
            new_main_deck: self.main,
        });
        Some(self.main)
    }

    /// Abort the in-flight transition: drop pending automation on both decks,
    /// restore the previous main deck to full and silence the other.
    pub fn cancel(&mut self, reason: &str) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        log::warn!("Transition {} -> {} aborted: {reason}", active.outgoing, active.incoming);
        self.restore(active.outgoing);
        self.events.emit(MixEvent::TransitionAborted {
            reason: reason.to_string(),
        });
        true
    }

    fn restore(&mut self, main: DeckId) {
        self.graph.flush();
        let other = main.other();
        for cmd in [
            GraphCmd::Reset { deck: main, stem_volume: 1.0, deck_gain: 1.0 },
            GraphCmd::Reset { deck: other, stem_volume: 0.0, deck_gain: 0.0 },
            GraphCmd::Unload { deck: other },
        ] {
            if let Err(e) = self.graph.send(cmd) {
                log::warn!("Restoring deck state failed: {e}");
            }
        }
        self.graph.flush();
        self.main = main;
    }

    fn issue_due(&mut self) {
        let horizon = self.now() + self.config.lookahead_ms as f64 / 1000.0;
        let Some(active) = self.active.as_mut() else {
            return;
        };

        while let Some(phase) = active.phases.get(active.next_phase) {
            if phase.at > horizon {
                break;
            }
            let mut sent = true;
            for &(stem, target) in &phase.per_stem {
                for (deck, value) in [(active.outgoing, target.deck_a), (active.incoming, target.deck_b)] {
                    let cmd = if phase.ramp_secs <= 0.0 {
                        GraphCmd::SetStem { deck, stem, at: phase.at, value }
                    } else {
                        GraphCmd::RampStem {
                            deck,
                            stem,
                            start: phase.at,
                            end: phase.at + phase.ramp_secs,
                            target: value,
                        }
                    };
                    if let Err(e) = self.graph.send(cmd) {
                        log::warn!("Phase {} deferred: {e}", active.next_phase);
                        sent = false;
                        break;
                    }
                    self.events.emit(MixEvent::StemVolumeChanged { deck, stem, volume: value });
                }
                if !sent {
                    break;
                }
            }
            if !sent {
                // Re-sent whole on the next tick; duplicate set/ramp events are idempotent.
                return;
            }
            log::debug!(
                "Phase {} issued at {:.3}s over {:.3}s",
                active.next_phase,
                phase.at,
                phase.ramp_secs
            );
            active.next_phase += 1;
        }

        while let Some(fx) = active.effects.get(active.next_fx) {
            if fx.at > horizon {
                break;
            }
            if let Err(e) = self.graph.send(GraphCmd::Fx { deck: fx.deck, at: fx.at, change: fx.change }) {
                log::warn!("Effect cue deferred: {e}");
                return;
            }
            active.next_fx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{clock::SampleClock, stems::StemBuffer};
    use crate::scheduler::transition_planner::{
        EffectCue, TimePoint, TimePointKind, TransitionStyle,
    };

    const SR: u32 = 1000;

    fn scheduler() -> (MixScheduler, EventBus) {
        let bus = EventBus::new();
        let graph = AudioGraph::new(SampleClock::new(SR));
        (MixScheduler::new(SchedulerConfig::default(), graph, bus.clone()), bus)
    }

    fn stems(id: &str, secs: usize) -> Arc<StemSet> {
        let mut set = StemSet::new(id);
        for stem in Stem::ALL {
            set.insert(stem, StemBuffer::new(vec![0.25; secs * SR as usize], SR));
        }
        Arc::new(set)
    }

    fn point(t: f64, kind: TimePointKind) -> TimePoint {
        TimePoint {
            time_seconds: t,
            kind,
            description: String::new(),
        }
    }

    fn plan(exit: f64, entry: f64, schedule: StemSchedule, duration_ms: u64) -> TransitionPlan {
        TransitionPlan {
            outgoing_track: "a".into(),
            incoming_track: Some("b".into()),
            exit_point: point(exit, TimePointKind::PhraseStart),
            entry_point: point(entry, TimePointKind::TrackStart),
            style: TransitionStyle::StemTransition,
            duration_ms,
            stem_schedule: schedule,
            effects: Vec::new(),
            success_probability: 0.9,
            compatibility: None,
            beatmatch: None,
            fallback_reason: None,
        }
    }

    fn vocals(s: &MixScheduler, deck: DeckId) -> f32 {
        s.deck_state(deck).stem_volumes[&Stem::Vocals]
    }

    /// Tick every 10 ms until the transition completes, checking vocals never overlap.
    fn run_to_completion(s: &mut MixScheduler) -> DeckId {
        for _ in 0..10_000 {
            match s.tick() {
                TickOutcome::Completed { new_main } => return new_main,
                TickOutcome::Idle => panic!("transition vanished"),
                TickOutcome::InProgress { .. } => {}
            }
            let (a, b) = (vocals(s, DeckId::DeckA), vocals(s, DeckId::DeckB));
            assert!(!(a > 0.0 && b > 0.0), "vocal overlap at {:.3}: {a} {b}", s.now());
            s.graph.clock().advance(10);
        }
        panic!("transition never completed");
    }

    #[test]
    fn rejects_when_nothing_is_playing() {
        let (mut s, _) = scheduler();
        let err = s.execute(&plan(0.0, 0.0, StemSchedule::hard_cut().unwrap(), 0), stems("b", 5));
        assert!(matches!(
            err,
            Err(MixError::SchedulingConflict(ConflictReason::NothingPlaying))
        ));
        assert!(!s.is_in_flight());
        assert_eq!(s.deck_state(DeckId::DeckB).playback, PlaybackState::Idle);
    }

    #[test]
    fn second_trigger_is_rejected_without_side_effects() {
        let (mut s, _) = scheduler();
        s.load_main(stems("a", 20)).unwrap();
        s.execute(&plan(2.0, 0.0, StemSchedule::staged_handover(4000, 0.25).unwrap(), 4000), stems("b", 20))
            .unwrap();
        let before = s.deck_state(DeckId::DeckB);
        let err = s.execute(&plan(3.0, 5.0, StemSchedule::hard_cut().unwrap(), 0), stems("c", 20));
        assert!(matches!(
            err,
            Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight))
        ));
        let after = s.deck_state(DeckId::DeckB);
        assert_eq!(after.current_track, before.current_track);
        assert!(matches!(
            s.load_main(stems("d", 5)),
            Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight))
        ));
    }

    #[test]
    fn staged_handover_runs_on_the_audio_clock() {
        let (mut s, bus) = scheduler();
        let mut rx = bus.subscribe();
        s.load_main(stems("a", 30)).unwrap();
        s.graph.clock().advance_secs(1.0);
        s.execute(&plan(2.0, 5.0, StemSchedule::staged_handover(4000, 0.25).unwrap(), 4000), stems("b", 30))
            .unwrap();
        assert!(s.is_in_flight());
        assert_eq!(s.deck_state(DeckId::DeckB).playback, PlaybackState::Cued);
        assert!(Stem::ALL.iter().all(|st| s.deck_state(DeckId::DeckB).stem_volumes[st] == 0.0));

        // Transition starts at clock 2.0; bass ramps over the first second.
        s.graph.clock().advance_secs(0.95);
        assert!(matches!(s.tick(), TickOutcome::InProgress { .. }));
        s.graph.clock().advance_secs(0.55);
        let a = s.deck_state(DeckId::DeckA);
        let b = s.deck_state(DeckId::DeckB);
        assert!((a.stem_volumes[&Stem::Bass] - 0.5).abs() < 1e-3);
        assert!((b.stem_volumes[&Stem::Bass] - 0.5).abs() < 1e-3);
        assert_eq!(a.stem_volumes[&Stem::Drums], 1.0);
        assert!((b.position_seconds - 5.5).abs() < 1e-6);

        let new_main = run_to_completion(&mut s);
        assert_eq!(new_main, DeckId::DeckB);
        assert_eq!(s.main_deck(), DeckId::DeckB);
        assert!(s.now() >= 6.0);
        assert_eq!(s.deck_state(DeckId::DeckA).playback, PlaybackState::Idle);
        let b = s.deck_state(DeckId::DeckB);
        assert!(b.stem_volumes.values().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!((s.main_position() - (5.0 + s.now() - 2.0)).abs() < 1e-6);

        let mut saw_started = false;
        let mut saw_completed = false;
        let mut volume_events = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                MixEvent::TransitionStarted { outgoing, incoming, .. } => {
                    saw_started = outgoing == DeckId::DeckA && incoming == DeckId::DeckB
                }
                MixEvent::TransitionCompleted { new_main_deck } => {
                    saw_completed = new_main_deck == DeckId::DeckB
                }
                MixEvent::StemVolumeChanged { .. } => volume_events += 1,
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);
        // Five stem entries across four phases, each setting both decks.
        assert_eq!(volume_events, 10);
    }

    #[test]
    fn cancel_restores_previous_main() {
        let (mut s, _) = scheduler();
        s.load_main(stems("a", 30)).unwrap();
        s.execute(&plan(1.0, 0.0, StemSchedule::staged_handover(8000, 0.25).unwrap(), 8000), stems("b", 30))
            .unwrap();
        for _ in 0..200 {
            s.tick();
            s.graph.clock().advance(10);
        }
        assert!(s.deck_state(DeckId::DeckA).stem_volumes[&Stem::Bass] < 1.0);

        assert!(s.cancel("operator abort"));
        assert!(!s.cancel("again"));
        assert_eq!(s.main_deck(), DeckId::DeckA);
        let a = s.deck_state(DeckId::DeckA);
        assert!(a.stem_volumes.values().all(|&v| v == 1.0));
        assert_eq!(a.deck_gain, 1.0);
        let b = s.deck_state(DeckId::DeckB);
        assert_eq!(b.playback, PlaybackState::Idle);
        assert_eq!(b.deck_gain, 0.0);

        // Nothing scheduled earlier resurfaces later.
        s.graph.clock().advance_secs(10.0);
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert!(s.deck_state(DeckId::DeckA).stem_volumes.values().all(|&v| v == 1.0));
    }

    #[test]
    fn empty_schedule_becomes_full_mix_crossfade() {
        let (mut s, _) = scheduler();
        s.load_main(stems("a", 30)).unwrap();
        let mut p = plan(0.0, 0.0, StemSchedule::empty(), 2000);
        p.style = TransitionStyle::Fallback;
        s.execute(&p, stems("b", 30)).unwrap();
        let new_main = run_to_completion(&mut s);
        assert_eq!(new_main, DeckId::DeckB);
        // Lead 50 ms + 2 s crossfade.
        assert!(s.now() >= 2.05 && s.now() < 2.1, "{}", s.now());
    }

    #[test]
    fn effect_cues_extend_the_transition() {
        let (mut s, _) = scheduler();
        s.load_main(stems("a", 30)).unwrap();
        let mut p = plan(0.0, 0.0, StemSchedule::hard_cut().unwrap(), 0);
        p.style = TransitionStyle::HardCut;
        p.effects = vec![EffectCue {
            role: DeckRole::Incoming,
            offset_ms: 1500,
            change: FxChange::Clear,
        }];
        s.execute(&p, stems("b", 30)).unwrap();
        run_to_completion(&mut s);
        assert!(s.now() >= 1.55, "{}", s.now());
    }
}
