use rustfft::{num_complex::Complex32, FftPlanner};
use serde::{Deserialize, Serialize};

use super::AnalysisFailure;

const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
];

// Krumhansl-Kessler key profiles, tonic first.
const MAJOR_PROFILE: [f32; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f32; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

const MIN_FREQ_HZ: f32 = 55.0;
const MAX_FREQ_HZ: f32 = 5000.0;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Major,
    Minor,
}

/// `A` = minor ring, `B` = major ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WheelLetter {
    A,
    B,
}

/// Position on the 24-node harmonic wheel (Camelot notation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WheelPosition {
    /// 1..=12
    pub number: u8,
    pub letter: WheelLetter,
}

impl WheelPosition {
    pub fn from_key(tonic: u8, mode: KeyMode) -> Self {
        // Relative major shares the number: A minor and C major are both 8.
        let major_tonic = match mode {
            KeyMode::Major => tonic % 12,
            KeyMode::Minor => (tonic + 3) % 12,
        };
        let number = ((major_tonic as u32 * 7 % 12 + 7) % 12 + 1) as u8;
        let letter = match mode {
            KeyMode::Major => WheelLetter::B,
            KeyMode::Minor => WheelLetter::A,
        };
        Self { number, letter }
    }

    /// Parse `"8B"`, `"12a"` and the like.
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        let (idx, _) = code.char_indices().last()?;
        let (num, letter) = code.split_at(idx);
        let number: u8 = num.parse().ok()?;
        if !(1..=12).contains(&number) {
            return None;
        }
        let letter = match letter {
            "A" | "a" => WheelLetter::A,
            "B" | "b" => WheelLetter::B,
            _ => return None,
        };
        Some(Self { number, letter })
    }

    pub fn code(&self) -> String {
        let l = match self.letter {
            WheelLetter::A => 'A',
            WheelLetter::B => 'B',
        };
        format!("{}{}", self.number, l)
    }

    /// Shortest step count around the 12-number ring.
    pub fn ring_distance(&self, other: &WheelPosition) -> u8 {
        let d = (self.number as i16 - other.number as i16).unsigned_abs() as u8;
        d.min(12 - d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MusicalKey {
    /// Pitch class of the tonic, 0 = C.
    pub tonic: u8,
    pub mode: KeyMode,
    pub wheel: WheelPosition,
    pub confidence: f32,
}

impl MusicalKey {
    pub fn new(tonic: u8, mode: KeyMode, confidence: f32) -> Self {
        Self {
            tonic: tonic % 12,
            mode,
            wheel: WheelPosition::from_key(tonic, mode),
            confidence,
        }
    }

    /// The default when nothing can be estimated (8B).
    pub fn c_major() -> Self {
        Self::new(0, KeyMode::Major, 0.0)
    }

    pub fn name(&self) -> String {
        let mode = match self.mode {
            KeyMode::Major => "major",
            KeyMode::Minor => "minor",
        };
        format!("{} {}", PITCH_NAMES[self.tonic as usize % 12], mode)
    }
}

// ── Estimation ──────────────────────────────────────────────────────────────

/// 12-bin pitch-class profile, normalized to a peak of 1.0.
pub fn chromagram(samples: &[f32], sample_rate: u32) -> Option<[f32; 12]> {
    if sample_rate == 0 {
        return None;
    }
    // ≈46 ms at 44.1 kHz, rounded to a power of two for the FFT.
    let window = ((sample_rate as f32 * 0.046) as usize).next_power_of_two().max(256);
    let hop = window / 2;
    if samples.len() < window {
        return None;
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(window);
    let hann: Vec<f32> = (0..window)
        .map(|i| {
            0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (window - 1) as f32).cos()
        })
        .collect();

    let bin_hz = sample_rate as f32 / window as f32;
    let bin_class: Vec<Option<usize>> = (0..window / 2)
        .map(|k| {
            let f = k as f32 * bin_hz;
            if !(MIN_FREQ_HZ..=MAX_FREQ_HZ).contains(&f) {
                return None;
            }
            // Semitones from A4, shifted so 0 = C.
            let from_a = (12.0 * (f / 440.0).log2()).round() as i32;
            Some((from_a.rem_euclid(12) as usize + 9) % 12)
        })
        .collect();

    let mut chroma = [0.0_f32; 12];
    let mut buffer = vec![Complex32::new(0.0, 0.0); window];
    let mut start = 0;
    while start + window <= samples.len() {
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = Complex32::new(samples[start + i] * hann[i], 0.0);
        }
        fft.process(&mut buffer);
        for (k, class) in bin_class.iter().enumerate() {
            if let Some(c) = class {
                chroma[*c] += buffer[k].norm();
            }
        }
        start += hop;
    }

    let peak = chroma.iter().cloned().fold(0.0_f32, f32::max);
    if peak <= 1e-9 {
        return None;
    }
    for c in chroma.iter_mut() {
        *c /= peak;
    }
    Some(chroma)
}

/// Best of the 24 major/minor templates over the summed chroma of `buffers`.
pub fn estimate_key(buffers: &[&[f32]], sample_rate: u32) -> Result<MusicalKey, AnalysisFailure> {
    let mut total = [0.0_f32; 12];
    let mut any = false;
    for buf in buffers {
        if let Some(c) = chromagram(buf, sample_rate) {
            for (t, v) in total.iter_mut().zip(c.iter()) {
                *t += v;
            }
            any = true;
        }
    }
    if !any {
        return Err(AnalysisFailure::Silent);
    }

    let mut best = (0_u8, KeyMode::Major, f32::MIN);
    for tonic in 0..12_u8 {
        for (mode, profile) in [(KeyMode::Major, &MAJOR_PROFILE), (KeyMode::Minor, &MINOR_PROFILE)] {
            let rotated: [f32; 12] = std::array::from_fn(|pc| profile[(pc + 12 - tonic as usize) % 12]);
            let r = pearson(&total, &rotated);
            if r > best.2 {
                best = (tonic, mode, r);
            }
        }
    }

    Ok(MusicalKey::new(best.0, best.1, best.2.clamp(0.0, 1.0)))
}

fn pearson(a: &[f32; 12], b: &[f32; 12]) -> f32 {
    let ma = a.iter().sum::<f32>() / 12.0;
    let mb = b.iter().sum::<f32>() / 12.0;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..12 {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom <= 1e-12 {
        0.0
    } else {
        cov / denom
    }
}
