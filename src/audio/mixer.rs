use serde::{Deserialize, Serialize};

use super::deck::DeckId;

/// Per-deck output strip with peak metering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStrip {
    /// Post-deck peak level, refreshed each render block.
    pub peak_db: f32,
}

impl Default for ChannelStrip {
    fn default() -> Self {
        Self { peak_db: -96.0 }
    }
}

/// Two-deck mixer → stereo master bus.
///
/// All buffers are interleaved stereo f32 (L R L R …).
pub struct Mixer {
    pub deck_a: ChannelStrip,
    pub deck_b: ChannelStrip,
    pub master_gain: f32,
    pub master_peak_db: f32,
}

impl Default for Mixer {
    fn default() -> Self {
        Self {
            deck_a: ChannelStrip::default(),
            deck_b: ChannelStrip::default(),
            master_gain: 1.0,
            master_peak_db: -96.0,
        }
    }
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, id: DeckId) -> &ChannelStrip {
        match id {
            DeckId::DeckA => &self.deck_a,
            DeckId::DeckB => &self.deck_b,
        }
    }

    /// Sum both deck buffers into `master_buf`.
    ///
    /// Called on the render thread; allocation-free.
    pub fn mix_into(&mut self, master_buf: &mut [f32], ch_deck_a: &[f32], ch_deck_b: &[f32]) {
        debug_assert_eq!(master_buf.len(), ch_deck_a.len());
        debug_assert_eq!(master_buf.len(), ch_deck_b.len());

        master_buf.fill(0.0);

        Self::accumulate(master_buf, ch_deck_a, &mut self.deck_a);
        Self::accumulate(master_buf, ch_deck_b, &mut self.deck_b);

        let mut peak = 0.0_f32;
        for s in master_buf.iter_mut() {
            *s *= self.master_gain;
            peak = peak.max(s.abs());
        }
        self.master_peak_db = linear_to_db(peak);
    }

    #[inline]
    fn accumulate(dest: &mut [f32], src: &[f32], ch: &mut ChannelStrip) {
        let mut peak = 0.0_f32;
        for (&s, d) in src.iter().zip(dest.iter_mut()) {
            *d += s;
            peak = peak.max(s.abs());
        }
        ch.peak_db = linear_to_db(peak);
    }
}

#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear < 1e-10 {
        -96.0
    } else {
        20.0 * linear.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_decks_and_meters() {
        let mut mixer = Mixer::new();
        let a = [0.5, 0.5, 0.25, 0.25];
        let b = [0.25, 0.25, 0.0, 0.0];
        let mut out = [0.0; 4];
        mixer.mix_into(&mut out, &a, &b);
        assert_eq!(out, [0.75, 0.75, 0.25, 0.25]);
        assert!((mixer.channel(DeckId::DeckA).peak_db - linear_to_db(0.5)).abs() < 1e-6);
        assert!(mixer.master_peak_db < 0.0);
    }

    #[test]
    fn silent_deck_reads_floor() {
        let mut mixer = Mixer::new();
        let mut out = [0.0; 2];
        mixer.mix_into(&mut out, &[0.0, 0.0], &[1.0, 1.0]);
        assert_eq!(out, [1.0, 1.0]);
        assert_eq!(mixer.channel(DeckId::DeckA).peak_db, -96.0);
        assert!(mixer.channel(DeckId::DeckB).peak_db.abs() < 1e-6);
    }
}
