/// tanh soft clipper. `amount` 0.0 bypasses, 1.0 is heavy saturation.
pub struct DriveStage {
    amount: f32,
    k: f32,
    norm: f32,
}

impl DriveStage {
    pub fn new() -> Self {
        Self {
            amount: 0.0,
            k: 1.0,
            norm: 1.0,
        }
    }

    pub fn amount(&self) -> f32 {
        self.amount
    }

    pub fn set(&mut self, amount: f32) {
        self.amount = amount.clamp(0.0, 1.0);
        self.k = 1.0 + self.amount * 9.0;
        self.norm = 1.0 / self.k.tanh();
    }

    #[inline]
    pub fn process(&self, sample: f32) -> f32 {
        if self.amount <= 0.0 {
            return sample;
        }
        (sample * self.k).tanh() * self.norm
    }
}

impl Default for DriveStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_maps_to_full_scale() {
        let mut d = DriveStage::new();
        d.set(1.0);
        assert!((d.process(1.0) - 1.0).abs() < 1e-5);
        assert!(d.process(0.1) > 0.1, "quiet input should be pushed up");
    }

    #[test]
    fn zero_amount_bypasses() {
        let d = DriveStage::new();
        assert_eq!(d.process(0.33), 0.33);
    }
}
