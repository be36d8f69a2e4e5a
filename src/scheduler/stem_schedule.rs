use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::stems::Stem;

/// Target volumes for one stem. `deck_a` is the outgoing deck, `deck_b` the
/// incoming one, whichever physical decks those are.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StemTarget {
    pub deck_a: f32,
    pub deck_b: f32,
}

impl StemTarget {
    pub const HANDOVER: StemTarget = StemTarget { deck_a: 0.0, deck_b: 1.0 };
    pub const SILENT: StemTarget = StemTarget { deck_a: 0.0, deck_b: 0.0 };
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("phase {phase} gives both decks audible vocals")]
    VocalsOnBothDecks { phase: usize },
    #[error("phase {phase} raises incoming vocals before outgoing vocals reach zero")]
    VocalOverlap { phase: usize },
    #[error("phase {phase} starts before the phase preceding it")]
    OutOfOrder { phase: usize },
}

/// One step of a handover: at `offset_ms` after transition start, ramp the
/// listed stems to their targets over `ramp_ms` (0 = instantaneous).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemPhase {
    pub offset_ms: u64,
    pub ramp_ms: u64,
    pub per_stem: BTreeMap<Stem, StemTarget>,
}

impl StemPhase {
    pub fn new(
        offset_ms: u64,
        ramp_ms: u64,
        per_stem: impl IntoIterator<Item = (Stem, StemTarget)>,
    ) -> Result<Self, ScheduleError> {
        let per_stem: BTreeMap<Stem, StemTarget> = per_stem.into_iter().collect();
        if let Some(v) = per_stem.get(&Stem::Vocals) {
            if v.deck_a > 0.0 && v.deck_b > 0.0 {
                return Err(ScheduleError::VocalsOnBothDecks { phase: 0 });
            }
        }
        Ok(Self {
            offset_ms,
            ramp_ms,
            per_stem,
        })
    }

    pub fn end_ms(&self) -> u64 {
        self.offset_ms + self.ramp_ms
    }
}

/// Ordered phases of one transition.
///
/// Construction checks that offsets never go backwards and that incoming
/// vocals only rise once the outgoing vocal ramp has finished at zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StemSchedule {
    phases: Vec<StemPhase>,
}

impl StemSchedule {
    pub fn new(phases: Vec<StemPhase>) -> Result<Self, ScheduleError> {
        // `None` = audible. The outgoing deck starts with vocals up, the incoming one silent.
        let mut outgoing_silent_from: Option<u64> = None;
        let mut incoming_silent_from: Option<u64> = Some(0);
        let mut last_offset = 0;

        for (i, phase) in phases.iter().enumerate() {
            if phase.offset_ms < last_offset {
                return Err(ScheduleError::OutOfOrder { phase: i });
            }
            last_offset = phase.offset_ms;

            let Some(v) = phase.per_stem.get(&Stem::Vocals) else {
                continue;
            };
            if v.deck_a > 0.0 && v.deck_b > 0.0 {
                return Err(ScheduleError::VocalsOnBothDecks { phase: i });
            }

            let outgoing = settle(outgoing_silent_from, v.deck_a, phase.end_ms());
            let incoming = settle(incoming_silent_from, v.deck_b, phase.end_ms());
            let silent_by = |s: Option<u64>| s.map(|t| t <= phase.offset_ms).unwrap_or(false);
            if (v.deck_b > 0.0 && !silent_by(outgoing)) || (v.deck_a > 0.0 && !silent_by(incoming)) {
                return Err(ScheduleError::VocalOverlap { phase: i });
            }
            outgoing_silent_from = outgoing;
            incoming_silent_from = incoming;
        }
        Ok(Self { phases })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Bass, drums, other, then vocals, each phase `spacing` of the total
    /// apart. Outgoing vocals fade with the bass so they are gone well before
    /// the incoming vocals enter.
    pub fn staged_handover(duration_ms: u64, spacing: f64) -> Result<Self, ScheduleError> {
        let spacing = spacing.clamp(0.0, 1.0 / 3.0);
        let step = (duration_ms as f64 * spacing).round() as u64;
        let last_offset = (step * 3).min(duration_ms);

        let phases = vec![
            phase(0, step, [(Stem::Bass, StemTarget::HANDOVER), (Stem::Vocals, StemTarget::SILENT)]),
            phase(step, step, [(Stem::Drums, StemTarget::HANDOVER)]),
            phase(step * 2, step, [(Stem::Other, StemTarget::HANDOVER)]),
            phase(
                last_offset,
                duration_ms - last_offset,
                [(Stem::Vocals, StemTarget::HANDOVER)],
            ),
        ];
        Self::new(phases)
    }

    /// Every stem swaps at the same instant.
    pub fn hard_cut() -> Result<Self, ScheduleError> {
        Self::new(vec![phase(0, 0, Stem::ALL.map(|s| (s, StemTarget::HANDOVER)))])
    }

    /// Plain crossfade of the instrumental stems over the whole duration;
    /// vocals hand over at the midpoint with no overlap.
    pub fn full_mix_crossfade(duration_ms: u64) -> Result<Self, ScheduleError> {
        let half = duration_ms / 2;
        Self::new(vec![
            phase(
                0,
                duration_ms,
                [Stem::Drums, Stem::Bass, Stem::Other].map(|s| (s, StemTarget::HANDOVER)),
            ),
            phase(0, half, [(Stem::Vocals, StemTarget::SILENT)]),
            phase(half, duration_ms - half, [(Stem::Vocals, StemTarget::HANDOVER)]),
        ])
    }

    pub fn phases(&self) -> &[StemPhase] {
        &self.phases
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Time at which the last ramp finishes.
    pub fn total_ms(&self) -> u64 {
        self.phases.iter().map(StemPhase::end_ms).max().unwrap_or(0)
    }
}

/// When a deck's vocals are silent after ramping to `target` by `end_ms`.
fn settle(silent_from: Option<u64>, target: f32, end_ms: u64) -> Option<u64> {
    if target > 0.0 {
        None
    } else {
        silent_from.or(Some(end_ms))
    }
}

fn phase<const N: usize>(offset_ms: u64, ramp_ms: u64, per_stem: [(Stem, StemTarget); N]) -> StemPhase {
    StemPhase {
        offset_ms,
        ramp_ms,
        per_stem: per_stem.into_iter().collect(),
    }
}
