use std::sync::{Arc, Mutex, MutexGuard};

use ringbuf::{traits::Split, HeapRb};

use super::{
    clock::{AudioClock, SampleClock},
    deck::{Deck, DeckId, DeckState},
    dsp::FxChange,
    mixer::Mixer,
    stems::{Stem, StemSet},
};
use crate::error::{MixError, MixResult};

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the control side → render side via a lock-free queue.
/// All times are audio-clock seconds.
#[derive(Debug)]
pub enum GraphCmd {
    Load { deck: DeckId, stems: Arc<StemSet> },
    Start { deck: DeckId, at: f64, track_secs: f64 },
    Unload { deck: DeckId },
    SetStem { deck: DeckId, stem: Stem, at: f64, value: f32 },
    RampStem { deck: DeckId, stem: Stem, start: f64, end: f64, target: f32 },
    SetGain { deck: DeckId, at: f64, value: f32 },
    RampGain { deck: DeckId, start: f64, end: f64, target: f32 },
    Fx { deck: DeckId, at: f64, change: FxChange },
    /// Drop all pending automation and pin stem volumes and deck gain.
    Reset { deck: DeckId, stem_volume: f32, deck_gain: f32 },
}

// ── Render state ────────────────────────────────────────────────────────────

struct RtState {
    decks: [Deck; 2],
    mixer: Mixer,
    cmd_cons: ringbuf::HeapCons<GraphCmd>,
    sample_rate: u32,
    // Per-deck scratch buffers (avoid alloc in render)
    buf_deck_a: Vec<f32>,
    buf_deck_b: Vec<f32>,
}

impl RtState {
    fn deck_mut(&mut self, id: DeckId) -> &mut Deck {
        &mut self.decks[id.index()]
    }

    /// Drain pending commands and apply them.
    fn process_commands(&mut self) {
        use ringbuf::traits::Consumer as _;

        while let Some(cmd) = self.cmd_cons.try_pop() {
            match cmd {
                GraphCmd::Load { deck, stems } => self.deck_mut(deck).load(stems),
                GraphCmd::Start { deck, at, track_secs } => {
                    self.deck_mut(deck).start_at(at, track_secs)
                }
                GraphCmd::Unload { deck } => self.deck_mut(deck).unload(),
                GraphCmd::SetStem { deck, stem, at, value } => {
                    self.deck_mut(deck).stem_lane_mut(stem).set_at(at, value)
                }
                GraphCmd::RampStem { deck, stem, start, end, target } => {
                    self.deck_mut(deck).stem_lane_mut(stem).ramp(start, end, target)
                }
                GraphCmd::SetGain { deck, at, value } => {
                    self.deck_mut(deck).gain_lane_mut().set_at(at, value)
                }
                GraphCmd::RampGain { deck, start, end, target } => {
                    self.deck_mut(deck).gain_lane_mut().ramp(start, end, target)
                }
                GraphCmd::Fx { deck, at, change } => self.deck_mut(deck).schedule_fx(at, change),
                GraphCmd::Reset { deck, stem_volume, deck_gain } => {
                    self.deck_mut(deck).reset(stem_volume, deck_gain)
                }
            }
        }
    }
}

// ── AudioGraph ──────────────────────────────────────────────────────────────

/// Two-deck stem graph: per-stem volume → deck gain → fx → master.
///
/// The control side enqueues [`GraphCmd`]s; whichever thread renders drains
/// them at the top of each block. [`AudioGraph::flush`] lets the control side
/// apply them itself when it needs an up-to-date view.
pub struct AudioGraph {
    cmd_tx: ringbuf::HeapProd<GraphCmd>,
    rt_state: Arc<Mutex<RtState>>,
    clock: SampleClock,
}

/// Cloneable handle for the render thread.
#[derive(Clone)]
pub struct RenderHandle {
    rt_state: Arc<Mutex<RtState>>,
    clock: SampleClock,
}

impl AudioGraph {
    const CMD_RING_SIZE: usize = 512;

    pub fn new(clock: SampleClock) -> Self {
        let sample_rate = clock.sample_rate();
        let cmd_rb = HeapRb::<GraphCmd>::new(Self::CMD_RING_SIZE);
        let (cmd_prod, cmd_cons) = cmd_rb.split();

        let rt_state = Arc::new(Mutex::new(RtState {
            decks: [
                Deck::new(DeckId::DeckA, sample_rate),
                Deck::new(DeckId::DeckB, sample_rate),
            ],
            mixer: Mixer::new(),
            cmd_cons,
            sample_rate,
            buf_deck_a: Vec::new(),
            buf_deck_b: Vec::new(),
        }));

        Self {
            cmd_tx: cmd_prod,
            rt_state,
            clock,
        }
    }

    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn render_handle(&self) -> RenderHandle {
        RenderHandle {
            rt_state: Arc::clone(&self.rt_state),
            clock: self.clock.clone(),
        }
    }

    pub fn send(&mut self, cmd: GraphCmd) -> MixResult<()> {
        use ringbuf::traits::Producer as _;
        self.cmd_tx.try_push(cmd).map_err(|_| MixError::QueueFull)
    }

    /// Room left in the command queue.
    pub fn capacity_left(&self) -> usize {
        use ringbuf::traits::Observer as _;
        self.cmd_tx.vacant_len()
    }

    /// Apply queued commands from the control side.
    pub fn flush(&self) {
        self.lock().process_commands();
    }

    pub fn deck_state(&self, deck: DeckId) -> DeckState {
        let mut rt = self.lock();
        rt.process_commands();
        rt.decks[deck.index()].snapshot(self.clock.now())
    }

    pub fn position(&self, deck: DeckId) -> f64 {
        let mut rt = self.lock();
        rt.process_commands();
        rt.decks[deck.index()].position_at(self.clock.now())
    }

    pub fn master_peak_db(&self) -> f32 {
        self.lock().mixer.master_peak_db
    }

    fn lock(&self) -> MutexGuard<'_, RtState> {
        self.rt_state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RenderHandle {
    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    /// Render one interleaved stereo block and advance the clock.
    ///
    /// If the control side holds the lock, output silence rather than block.
    pub fn render(&self, output: &mut [f32]) {
        let frames = (output.len() / 2) as u64;
        match self.rt_state.try_lock() {
            Ok(mut rt) => render_block(&mut rt, output, self.clock.now()),
            Err(_) => output.fill(0.0),
        }
        self.clock.advance(frames);
    }
}

fn render_block(rt: &mut RtState, output: &mut [f32], now: f64) {
    rt.process_commands();

    let len = output.len();
    if rt.buf_deck_a.len() != len {
        rt.buf_deck_a.resize(len, 0.0);
        rt.buf_deck_b.resize(len, 0.0);
    }

    let sample_rate = rt.sample_rate;
    let RtState {
        decks,
        mixer,
        buf_deck_a,
        buf_deck_b,
        ..
    } = rt;

    let [deck_a, deck_b] = decks;
    deck_a.fill_buffer(buf_deck_a, now, sample_rate);
    deck_b.fill_buffer(buf_deck_b, now, sample_rate);

    mixer.mix_into(output, &buf_deck_a[..], &buf_deck_b[..]);
    deck_a.peak_db = mixer.deck_a.peak_db;
    deck_b.peak_db = mixer.deck_b.peak_db;

    let block_end = now + (len / 2) as f64 / sample_rate.max(1) as f64;
    deck_a.prune(block_end);
    deck_b.prune(block_end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stems::StemBuffer;

    fn graph(sr: u32) -> AudioGraph {
        AudioGraph::new(SampleClock::new(sr))
    }

    fn constant_stems(id: &str, value: f32, secs: usize, sr: u32) -> Arc<StemSet> {
        Arc::new(StemSet::new(id).with_stem(Stem::Bass, StemBuffer::new(vec![value; secs * sr as usize], sr)))
    }

    #[test]
    fn render_advances_clock() {
        let g = graph(1000);
        let handle = g.render_handle();
        let mut out = vec![0.0; 200];
        handle.render(&mut out);
        assert_eq!(g.clock().frames(), 100);
    }

    #[test]
    fn commands_apply_on_flush_without_rendering() {
        let mut g = graph(1000);
        g.send(GraphCmd::Load { deck: DeckId::DeckA, stems: constant_stems("a", 0.5, 10, 1000) })
            .unwrap();
        g.send(GraphCmd::SetStem { deck: DeckId::DeckA, stem: Stem::Bass, at: 0.0, value: 1.0 })
            .unwrap();
        g.send(GraphCmd::Start { deck: DeckId::DeckA, at: 0.0, track_secs: 3.0 }).unwrap();
        g.flush();

        let state = g.deck_state(DeckId::DeckA);
        assert_eq!(state.current_track.as_deref(), Some("a"));
        assert_eq!(state.stem_volumes[&Stem::Bass], 1.0);
        assert_eq!(state.deck_gain, 1.0);
        g.clock().advance(500);
        assert!((g.position(DeckId::DeckA) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn ramp_is_heard_sample_accurately() {
        let mut g = graph(1000);
        g.send(GraphCmd::Load { deck: DeckId::DeckB, stems: constant_stems("b", 1.0, 5, 1000) })
            .unwrap();
        g.send(GraphCmd::Start { deck: DeckId::DeckB, at: 0.0, track_secs: 0.0 }).unwrap();
        g.send(GraphCmd::RampStem { deck: DeckId::DeckB, stem: Stem::Bass, start: 0.0, end: 0.1, target: 1.0 })
            .unwrap();

        let handle = g.render_handle();
        let mut out = vec![0.0; 2 * 100];
        handle.render(&mut out);
        // Frame 50 is halfway up the ramp.
        assert!((out[100] - 0.5).abs() < 1e-4, "got {}", out[100]);
        assert!(out[0].abs() < 1e-6);
    }

    #[test]
    fn reset_cancels_pending_ramps() {
        let mut g = graph(1000);
        g.send(GraphCmd::Load { deck: DeckId::DeckA, stems: constant_stems("a", 1.0, 5, 1000) })
            .unwrap();
        g.send(GraphCmd::RampGain { deck: DeckId::DeckA, start: 1.0, end: 2.0, target: 0.0 })
            .unwrap();
        g.send(GraphCmd::Reset { deck: DeckId::DeckA, stem_volume: 1.0, deck_gain: 1.0 })
            .unwrap();
        g.clock().advance(1500);
        let state = g.deck_state(DeckId::DeckA);
        assert_eq!(state.deck_gain, 1.0);
        assert!(state.stem_volumes.values().all(|&v| v == 1.0));
    }

    #[test]
    fn full_queue_reports_error() {
        let mut g = graph(1000);
        let mut last = Ok(());
        for _ in 0..AudioGraph::CMD_RING_SIZE + 1 {
            last = g.send(GraphCmd::Unload { deck: DeckId::DeckA });
        }
        assert!(matches!(last, Err(MixError::QueueFull)));
        g.flush();
        assert_eq!(g.capacity_left(), AudioGraph::CMD_RING_SIZE);
    }
}
