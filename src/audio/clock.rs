use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Monotonic time source shared by the render path and the scheduler.
///
/// Every automation endpoint is expressed in this clock's seconds, never in
/// wall-clock time.
pub trait AudioClock: Send + Sync {
    /// Frames rendered since the clock was created.
    fn frames(&self) -> u64;

    fn sample_rate(&self) -> u32;

    fn now(&self) -> f64 {
        let sr = self.sample_rate();
        if sr == 0 {
            return 0.0;
        }
        self.frames() as f64 / sr as f64
    }
}

/// Sample-accurate clock driven by whoever renders audio.
#[derive(Debug, Clone)]
pub struct SampleClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl SampleClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    /// Called by the renderer after each block.
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn advance_secs(&self, secs: f64) {
        self.advance((secs.max(0.0) * self.sample_rate as f64).round() as u64);
    }
}

impl AudioClock for SampleClock {
    fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let clock = SampleClock::new(48_000);
        let view = clock.clone();
        clock.advance(24_000);
        assert!((view.now() - 0.5).abs() < 1e-12);
        clock.advance_secs(1.5);
        assert_eq!(view.frames(), 96_000);
    }

    #[test]
    fn zero_rate_clock_stays_at_zero() {
        let clock = SampleClock::new(0);
        clock.advance(100);
        assert_eq!(clock.now(), 0.0);
    }
}
