use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{
    automation::AutomationLane,
    dsp::{filter::FilterState, DeckFx, FxChange},
    stems::{Stem, StemSet},
};

// ── DeckId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckId {
    DeckA,
    DeckB,
}

impl DeckId {
    pub fn other(self) -> Self {
        match self {
            DeckId::DeckA => DeckId::DeckB,
            DeckId::DeckB => DeckId::DeckA,
        }
    }

    pub fn index(self) -> usize {
        match self {
            DeckId::DeckA => 0,
            DeckId::DeckB => 1,
        }
    }
}

impl std::fmt::Display for DeckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeckId::DeckA => write!(f, "deck_a"),
            DeckId::DeckB => write!(f, "deck_b"),
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// Loaded, waiting for its clock-anchored start.
    Cued,
    Playing,
    Ended,
}

/// Externally visible deck state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckState {
    pub deck: DeckId,
    pub current_track: Option<String>,
    pub playback: PlaybackState,
    pub position_seconds: f64,
    pub duration_seconds: f64,
    pub stem_volumes: BTreeMap<Stem, f32>,
    pub deck_gain: f32,
    pub filter_state: FilterState,
    pub peak_db: f32,
}

// ── Deck ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PlayAnchor {
    clock_secs: f64,
    track_secs: f64,
}

/// One stem playback path: stems → per-stem gain → deck gain → fx.
///
/// Position is derived from the audio clock and the start anchor, so it stays
/// frame-accurate whether or not anything is rendering.
pub struct Deck {
    pub id: DeckId,
    stems: Option<Arc<StemSet>>,
    anchor: Option<PlayAnchor>,
    stem_lanes: [AutomationLane; 4],
    gain_lane: AutomationLane,
    fx: DeckFx,
    pending_fx: Vec<(f64, FxChange)>,
    pub(crate) peak_db: f32,
}

impl Deck {
    pub fn new(id: DeckId, sample_rate: u32) -> Self {
        Self {
            id,
            stems: None,
            anchor: None,
            stem_lanes: std::array::from_fn(|_| AutomationLane::new(0.0)),
            gain_lane: AutomationLane::new(0.0),
            fx: DeckFx::new(sample_rate as f32),
            pending_fx: Vec::new(),
            peak_db: -96.0,
        }
    }

    /// Replace the loaded track. Stems start silent until automation says otherwise.
    pub fn load(&mut self, stems: Arc<StemSet>) {
        self.stems = Some(stems);
        self.anchor = None;
        self.reset(0.0, 1.0);
    }

    pub fn unload(&mut self) {
        self.stems = None;
        self.anchor = None;
        self.reset(0.0, 0.0);
    }

    /// Start at `track_secs` when the clock reaches `clock_secs`.
    pub fn start_at(&mut self, clock_secs: f64, track_secs: f64) {
        if self.stems.is_some() {
            self.anchor = Some(PlayAnchor {
                clock_secs,
                track_secs: track_secs.max(0.0),
            });
        }
    }

    /// Cancel all automation and effect cues and pin every gain.
    pub fn reset(&mut self, stem_volume: f32, deck_gain: f32) {
        for lane in &mut self.stem_lanes {
            lane.cancel_all(stem_volume);
        }
        self.gain_lane.cancel_all(deck_gain);
        self.pending_fx.clear();
        self.fx.apply(FxChange::Clear);
    }

    pub fn stem_lane_mut(&mut self, stem: Stem) -> &mut AutomationLane {
        &mut self.stem_lanes[stem.index()]
    }

    pub fn gain_lane_mut(&mut self) -> &mut AutomationLane {
        &mut self.gain_lane
    }

    pub fn schedule_fx(&mut self, at: f64, change: FxChange) {
        let idx = self.pending_fx.partition_point(|(t, _)| *t <= at);
        self.pending_fx.insert(idx, (at, change));
    }

    pub fn track_id(&self) -> Option<&str> {
        self.stems.as_deref().map(|s| s.track_id.as_str())
    }

    pub fn duration_secs(&self) -> f64 {
        self.stems.as_deref().map(StemSet::duration_secs).unwrap_or(0.0)
    }

    pub fn is_loaded(&self) -> bool {
        self.stems.is_some()
    }

    pub fn playback_at(&self, now: f64) -> PlaybackState {
        match (&self.stems, self.anchor) {
            (None, _) => PlaybackState::Idle,
            (Some(_), None) => PlaybackState::Cued,
            (Some(_), Some(a)) if now < a.clock_secs => PlaybackState::Cued,
            (Some(s), Some(_)) => {
                if self.position_at(now) >= s.duration_secs() {
                    PlaybackState::Ended
                } else {
                    PlaybackState::Playing
                }
            }
        }
    }

    /// Track position at clock time `now`.
    pub fn position_at(&self, now: f64) -> f64 {
        match self.anchor {
            Some(a) => a.track_secs + (now - a.clock_secs).max(0.0),
            None => 0.0,
        }
    }

    pub fn apply_due_fx(&mut self, now: f64) {
        let due = self.pending_fx.partition_point(|(t, _)| *t <= now);
        for (_, change) in self.pending_fx.drain(..due) {
            self.fx.apply(change);
        }
    }

    pub fn snapshot(&self, now: f64) -> DeckState {
        DeckState {
            deck: self.id,
            current_track: self.track_id().map(str::to_string),
            playback: self.playback_at(now),
            position_seconds: self.position_at(now),
            duration_seconds: self.duration_secs(),
            stem_volumes: Stem::ALL
                .iter()
                .map(|&s| (s, self.stem_lanes[s.index()].value_at(now)))
                .collect(),
            deck_gain: self.gain_lane.value_at(now),
            filter_state: self.fx.filter.state(),
            peak_db: self.peak_db,
        }
    }

    /// Render interleaved stereo starting at clock time `start`.
    ///
    /// Called on the render thread; allocation-free.
    pub fn fill_buffer(&mut self, output: &mut [f32], start: f64, sample_rate: u32) {
        self.apply_due_fx(start);

        let (Some(stems), Some(anchor)) = (self.stems.as_deref(), self.anchor) else {
            output.fill(0.0);
            return;
        };

        let dt = 1.0 / sample_rate.max(1) as f64;
        for (i, frame) in output.chunks_exact_mut(2).enumerate() {
            let t = start + i as f64 * dt;
            let mut s = 0.0_f32;
            if t >= anchor.clock_secs {
                let pos = anchor.track_secs + (t - anchor.clock_secs);
                for (stem, buf) in stems.iter() {
                    let gain = self.stem_lanes[stem.index()].value_at(t);
                    if gain > 0.0 {
                        s += buf.sample_at(pos) * gain;
                    }
                }
                s *= self.gain_lane.value_at(t);
            }
            let out = self.fx.process(s);
            frame[0] = out;
            frame[1] = out;
        }
    }

    /// Forget automation that has fully played out.
    pub fn prune(&mut self, now: f64) {
        for lane in &mut self.stem_lanes {
            lane.prune(now);
        }
        self.gain_lane.prune(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stems::StemBuffer;

    fn stems(len: usize, sr: u32) -> Arc<StemSet> {
        Arc::new(
            StemSet::new("t")
                .with_stem(Stem::Vocals, StemBuffer::new(vec![0.1; len], sr))
                .with_stem(Stem::Drums, StemBuffer::new(vec![0.2; len], sr)),
        )
    }

    #[test]
    fn loaded_deck_is_silent_until_automated() {
        let mut deck = Deck::new(DeckId::DeckA, 100);
        deck.load(stems(1000, 100));
        deck.start_at(0.0, 0.0);
        let mut buf = vec![1.0; 20];
        deck.fill_buffer(&mut buf, 0.0, 100);
        assert!(buf.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn stem_gains_scale_output() {
        let mut deck = Deck::new(DeckId::DeckA, 100);
        deck.load(stems(1000, 100));
        deck.stem_lane_mut(Stem::Vocals).set_at(0.0, 1.0);
        deck.stem_lane_mut(Stem::Drums).set_at(0.0, 0.5);
        deck.start_at(0.0, 0.0);
        let mut buf = vec![0.0; 4];
        deck.fill_buffer(&mut buf, 0.0, 100);
        assert!((buf[0] - 0.2).abs() < 1e-6, "0.1*1 + 0.2*0.5, got {}", buf[0]);
        assert_eq!(buf[0], buf[1]);
    }

    #[test]
    fn position_follows_clock_after_anchor() {
        let mut deck = Deck::new(DeckId::DeckB, 100);
        deck.load(stems(1000, 100));
        deck.start_at(5.0, 2.0);
        assert_eq!(deck.playback_at(4.0), PlaybackState::Cued);
        assert_eq!(deck.position_at(4.0), 2.0);
        assert!((deck.position_at(6.5) - 3.5).abs() < 1e-12);
        assert_eq!(deck.playback_at(6.5), PlaybackState::Playing);
        assert_eq!(deck.playback_at(20.0), PlaybackState::Ended);
    }

    #[test]
    fn fx_cues_apply_when_due() {
        let mut deck = Deck::new(DeckId::DeckA, 1000);
        deck.schedule_fx(1.0, FxChange::Filter(FilterState::HighPass { cutoff_hz: 300.0 }));
        deck.apply_due_fx(0.5);
        assert_eq!(deck.snapshot(0.5).filter_state, FilterState::Bypass);
        deck.apply_due_fx(1.0);
        assert_eq!(
            deck.snapshot(1.0).filter_state,
            FilterState::HighPass { cutoff_hz: 300.0 }
        );
    }

    #[test]
    fn unload_silences_and_forgets_track() {
        let mut deck = Deck::new(DeckId::DeckA, 100);
        deck.load(stems(100, 100));
        deck.stem_lane_mut(Stem::Drums).set_at(0.0, 1.0);
        deck.unload();
        let snap = deck.snapshot(0.0);
        assert!(snap.current_track.is_none());
        assert_eq!(snap.deck_gain, 0.0);
        assert!(snap.stem_volumes.values().all(|&v| v == 0.0));
    }
}
