use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EchoSettings {
    pub delay_secs: f32,
    /// 0.0 – 0.95
    pub feedback: f32,
    /// Wet level added on top of the dry signal.
    pub mix: f32,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            delay_secs: 0.125,
            feedback: 0.3,
            mix: 0.4,
        }
    }
}

/// Feedback delay line. Allocated once for the longest supported delay.
pub struct EchoStage {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_frames: usize,
    settings: Option<EchoSettings>,
    sample_rate: f32,
}

impl EchoStage {
    pub const MAX_DELAY_SECS: f32 = 2.0;

    pub fn new(sample_rate: f32) -> Self {
        let len = (sample_rate * Self::MAX_DELAY_SECS).ceil().max(1.0) as usize;
        Self {
            buffer: vec![0.0; len],
            write_pos: 0,
            delay_frames: 1,
            settings: None,
            sample_rate,
        }
    }

    pub fn settings(&self) -> Option<EchoSettings> {
        self.settings
    }

    /// `None` disables the stage and drops the tail.
    pub fn set(&mut self, settings: Option<EchoSettings>) {
        match settings {
            Some(s) => {
                let frames = (s.delay_secs.max(0.0) * self.sample_rate).round() as usize;
                self.delay_frames = frames.clamp(1, self.buffer.len() - 1);
                self.settings = Some(EchoSettings {
                    feedback: s.feedback.clamp(0.0, 0.95),
                    ..s
                });
            }
            None => {
                self.settings = None;
                self.buffer.fill(0.0);
            }
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let Some(s) = self.settings else {
            return sample;
        };
        let len = self.buffer.len();
        let read = (self.write_pos + len - self.delay_frames) % len;
        let delayed = self.buffer[read];
        self.buffer[self.write_pos] = sample + delayed * s.feedback;
        self.write_pos = (self.write_pos + 1) % len;
        sample + delayed * s.mix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impulse_repeats_after_delay() {
        let mut echo = EchoStage::new(1000.0);
        echo.set(Some(EchoSettings {
            delay_secs: 0.01,
            feedback: 0.5,
            mix: 1.0,
        }));
        let out: Vec<f32> = (0..25)
            .map(|i| echo.process(if i == 0 { 1.0 } else { 0.0 }))
            .collect();
        assert_eq!(out[0], 1.0);
        assert!((out[10] - 1.0).abs() < 1e-6);
        assert!((out[20] - 0.5).abs() < 1e-6);
        assert_eq!(out[5], 0.0);
    }

    #[test]
    fn disabled_is_transparent() {
        let mut echo = EchoStage::new(1000.0);
        assert_eq!(echo.process(0.4), 0.4);
        echo.set(Some(EchoSettings::default()));
        echo.set(None);
        assert_eq!(echo.process(0.4), 0.4);
    }
}
