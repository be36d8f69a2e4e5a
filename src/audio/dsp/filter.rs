use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use serde::{Deserialize, Serialize};

/// Deck filter setting reported in `DeckState`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterState {
    #[default]
    Bypass,
    LowPass { cutoff_hz: f32 },
    HighPass { cutoff_hz: f32 },
}

/// Single Butterworth low/high-pass stage, one per deck.
pub struct DeckFilter {
    sample_rate: f32,
    state: FilterState,
    biquad: DirectForm2Transposed<f32>,
}

impl DeckFilter {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            state: FilterState::Bypass,
            biquad: DirectForm2Transposed::<f32>::new(Self::unity_coeffs()),
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Rebuild coefficients. Filter memory is kept so sweeps do not click.
    pub fn set(&mut self, state: FilterState) {
        if state == self.state {
            return;
        }
        let coeffs = Self::build_coeffs(self.sample_rate, state);
        self.biquad.update_coefficients(coeffs);
        self.state = state;
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        if matches!(self.state, FilterState::Bypass) {
            return sample;
        }
        self.biquad.run(sample)
    }

    pub fn reset(&mut self) {
        self.biquad = DirectForm2Transposed::<f32>::new(Self::unity_coeffs());
        self.state = FilterState::Bypass;
    }

    fn build_coeffs(sample_rate: f32, state: FilterState) -> Coefficients<f32> {
        let nyquist_guard = sample_rate / 2.0 - 1.0;
        let (kind, cutoff) = match state {
            FilterState::Bypass => return Self::unity_coeffs(),
            FilterState::LowPass { cutoff_hz } => (Type::LowPass, cutoff_hz),
            FilterState::HighPass { cutoff_hz } => (Type::HighPass, cutoff_hz),
        };
        Coefficients::<f32>::from_params(
            kind,
            sample_rate.hz(),
            cutoff.clamp(20.0, nyquist_guard.max(21.0)).hz(),
            Q_BUTTERWORTH_F32,
        )
        .unwrap_or_else(|_| Self::unity_coeffs())
    }

    fn unity_coeffs() -> Coefficients<f32> {
        Coefficients {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settle(filter: &mut DeckFilter, input: f32, n: usize) -> f32 {
        let mut out = 0.0;
        for _ in 0..n {
            out = filter.process(input);
        }
        out
    }

    #[test]
    fn bypass_passes_through() {
        let mut f = DeckFilter::new(44100.0);
        assert_eq!(f.process(0.3), 0.3);
    }

    #[test]
    fn high_pass_blocks_dc() {
        let mut f = DeckFilter::new(44100.0);
        f.set(FilterState::HighPass { cutoff_hz: 300.0 });
        let out = settle(&mut f, 0.5, 20_000);
        assert!(out.abs() < 1e-3, "DC should be removed: {out}");
    }

    #[test]
    fn low_pass_keeps_dc() {
        let mut f = DeckFilter::new(44100.0);
        f.set(FilterState::LowPass { cutoff_hz: 200.0 });
        let out = settle(&mut f, 0.5, 20_000);
        assert!((out - 0.5).abs() < 1e-3, "DC should pass: {out}");
    }

    #[test]
    fn reset_returns_to_bypass() {
        let mut f = DeckFilter::new(44100.0);
        f.set(FilterState::LowPass { cutoff_hz: 200.0 });
        f.reset();
        assert_eq!(f.state(), FilterState::Bypass);
    }
}
