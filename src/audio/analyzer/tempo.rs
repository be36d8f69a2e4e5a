use rustfft::{num_complex::Complex32, FftPlanner};

use super::AnalysisFailure;

pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 200.0;

/// Envelope rate. 4 ms resolution is plenty for beat-level timing.
const ENV_RATE: f32 = 250.0;
const HIGHPASS_HZ: f32 = 70.0;
const EMPHASIS_WINDOW_SECS: f32 = 0.2;
const EMPHASIS_RATIO: f32 = 1.5;
const EMPHASIS_GAIN: f32 = 2.0;
const MIN_PEAK_GAP_SECS: f32 = 0.08;
const MAX_CANDIDATES: usize = 15;
const MIN_ONSETS: usize = 4;

/// Weighted sub-ranges that counter the autocorrelation's pull toward mid tempos.
const TEMPO_BANDS: [(f64, f64, f32); 5] = [
    (60.0, 90.0, 0.85),
    (90.0, 120.0, 1.0),
    (120.0, 150.0, 1.0),
    (150.0, 180.0, 0.9),
    (180.0, 200.0, 0.8),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Onset {
    pub time_seconds: f64,
    pub strength: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempoEstimate {
    pub bpm: f64,
    pub confidence: f32,
    /// Detected onsets, ascending.
    pub onsets: Vec<Onset>,
}

/// Estimate the tempo of a single buffer.
pub fn estimate_tempo(samples: &[f32], sample_rate: u32) -> Result<TempoEstimate, AnalysisFailure> {
    if sample_rate == 0 || samples.len() < sample_rate as usize * 4 {
        return Err(AnalysisFailure::TooShort);
    }

    let filtered = high_pass(samples, sample_rate as f32, HIGHPASS_HZ);
    let hop = ((sample_rate as f32 / ENV_RATE).round() as usize).max(1);
    let env_rate = sample_rate as f32 / hop as f32;
    let envelope = build_envelope(&filtered, hop);

    let peak = envelope.iter().cloned().fold(0.0_f32, f32::max);
    if peak < 1e-4 {
        return Err(AnalysisFailure::Silent);
    }

    let emphasized = emphasize_transients(&envelope, (EMPHASIS_WINDOW_SECS * env_rate) as usize);
    let onset = onset_curve(&emphasized);

    let min_gap = ((MIN_PEAK_GAP_SECS * env_rate).round() as usize).max(1);
    let onsets = detect_onsets(&onset, env_rate, min_gap);
    if onsets.len() < MIN_ONSETS {
        return Err(AnalysisFailure::TooFewBeats(onsets.len()));
    }

    let max_lag = (env_rate as f64 * 60.0 / MIN_BPM).ceil() as usize;
    let search_len = (onset.len() / 2).min(env_rate as usize * 8);
    if search_len <= max_lag + 1 {
        return Err(AnalysisFailure::TooShort);
    }

    let acf = autocorrelation(&onset, search_len + 1);
    if acf[0] <= 0.0 {
        return Err(AnalysisFailure::Silent);
    }

    let prior_lag = weighted_prior_lag(&acf, env_rate as f64)
        .ok_or(AnalysisFailure::TooFewBeats(onsets.len()))?;

    let period = candidate_period(&acf, min_gap, MAX_CANDIDATES).unwrap_or(prior_lag as f64);
    let bpm = align_octave(fold_bpm(60.0 * env_rate as f64 / period), 60.0 * env_rate as f64 / prior_lag as f64);

    let lag_at_bpm = ((60.0 * env_rate as f64 / bpm).round() as usize).clamp(1, acf.len() - 2);
    let confidence = (acf[lag_at_bpm - 1..=lag_at_bpm + 1]
        .iter()
        .cloned()
        .fold(0.0_f32, f32::max)
        / acf[0])
        .clamp(0.0, 1.0);

    Ok(TempoEstimate {
        bpm,
        confidence,
        onsets,
    })
}

/// Estimate each buffer independently and merge by confidence.
///
/// Estimates are octave-aligned to the most confident one before averaging;
/// the onsets of that estimate are kept for grid snapping.
pub fn estimate_tempo_multi(
    buffers: &[&[f32]],
    sample_rate: u32,
) -> Result<TempoEstimate, AnalysisFailure> {
    let mut estimates = Vec::new();
    let mut last_err = AnalysisFailure::Silent;
    for buf in buffers {
        match estimate_tempo(buf, sample_rate) {
            Ok(e) => estimates.push(e),
            Err(e) => last_err = e,
        }
    }

    let best_idx = estimates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.confidence.total_cmp(&b.confidence))
        .map(|(i, _)| i)
        .ok_or(last_err)?;
    let reference = estimates[best_idx].bpm;

    let mut weighted = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for e in &estimates {
        let w = e.confidence.max(1e-3) as f64;
        weighted += align_octave(e.bpm, reference) * w;
        total_weight += w;
    }

    let best = estimates.swap_remove(best_idx);
    Ok(TempoEstimate {
        bpm: weighted / total_weight,
        confidence: best.confidence,
        onsets: best.onsets,
    })
}

/// Double or halve into `[MIN_BPM, MAX_BPM]`.
pub fn fold_bpm(mut bpm: f64) -> f64 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return 120.0;
    }
    while bpm < MIN_BPM {
        bpm *= 2.0;
    }
    while bpm > MAX_BPM {
        bpm /= 2.0;
    }
    bpm
}

/// Pick the octave of `bpm` (×½, ×1, ×2) closest to `reference`, staying in range.
pub fn align_octave(bpm: f64, reference: f64) -> f64 {
    [bpm * 0.5, bpm, bpm * 2.0]
        .into_iter()
        .filter(|b| (MIN_BPM..=MAX_BPM).contains(b))
        .min_by(|a, b| (a / reference).ln().abs().total_cmp(&(b / reference).ln().abs()))
        .unwrap_or(bpm)
}

// ── Signal helpers ──────────────────────────────────────────────────────────

/// Single-pole high-pass.
fn high_pass(samples: &[f32], sample_rate: f32, cutoff_hz: f32) -> Vec<f32> {
    let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
    let dt = 1.0 / sample_rate;
    let alpha = rc / (rc + dt);
    let mut out = Vec::with_capacity(samples.len());
    let mut prev_x = 0.0_f32;
    let mut prev_y = 0.0_f32;
    for &x in samples {
        let y = alpha * (prev_y + x - prev_x);
        out.push(y);
        prev_x = x;
        prev_y = y;
    }
    out
}

pub(crate) fn build_envelope(samples: &[f32], hop: usize) -> Vec<f32> {
    let mut env = Vec::with_capacity(samples.len() / hop + 1);
    for chunk in samples.chunks(hop) {
        let mut peak = 0.0_f32;
        for &s in chunk {
            peak = peak.max(s.abs());
        }
        env.push(peak);
    }
    env
}

/// Amplify envelope values that stand out above their trailing moving average.
fn emphasize_transients(env: &[f32], window: usize) -> Vec<f32> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(env.len());
    let mut sum = 0.0_f32;
    for (i, &v) in env.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= env[i - window];
        }
        let avg = sum / window.min(i + 1) as f32;
        if avg > 0.0 && v > EMPHASIS_RATIO * avg {
            out.push(v * EMPHASIS_GAIN);
        } else {
            out.push(v);
        }
    }
    out
}

fn onset_curve(env: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0_f32; env.len()];
    for i in 1..env.len() {
        let d = env[i] - env[i - 1];
        out[i] = if d > 0.0 { d } else { 0.0 };
    }
    out
}

fn detect_onsets(onset: &[f32], env_rate: f32, min_gap: usize) -> Vec<Onset> {
    let n = onset.len().max(1) as f32;
    let mean = onset.iter().sum::<f32>() / n;
    let var = onset.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let threshold = mean + 0.5 * var.sqrt();

    let candidates: Vec<(usize, f32)> = (1..onset.len().saturating_sub(1))
        .filter(|&i| onset[i] > threshold && onset[i] >= onset[i - 1] && onset[i] > onset[i + 1])
        .map(|i| (i, onset[i]))
        .collect();

    pick_peaks(candidates, min_gap, usize::MAX)
        .into_iter()
        .map(|(i, s)| Onset {
            time_seconds: i as f64 / env_rate as f64,
            strength: s,
        })
        .collect()
}

/// Greedy strongest-first selection with a minimum index gap; result sorted by index.
fn pick_peaks(mut candidates: Vec<(usize, f32)>, min_gap: usize, limit: usize) -> Vec<(usize, f32)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut accepted: Vec<(usize, f32)> = Vec::new();
    for (i, s) in candidates {
        if accepted.len() >= limit {
            break;
        }
        if accepted.iter().all(|(j, _)| i.abs_diff(*j) >= min_gap) {
            accepted.push((i, s));
        }
    }
    accepted.sort_by_key(|(i, _)| *i);
    accepted
}

/// Linear autocorrelation of the mean-removed signal via FFT, lags `0..max_lag`.
fn autocorrelation(signal: &[f32], max_lag: usize) -> Vec<f32> {
    let mean = signal.iter().sum::<f32>() / signal.len().max(1) as f32;
    let n = (signal.len() * 2).next_power_of_two();

    let mut planner = FftPlanner::<f32>::new();
    let fwd = planner.plan_fft_forward(n);
    let inv = planner.plan_fft_inverse(n);

    let mut buf: Vec<Complex32> = signal
        .iter()
        .map(|&v| Complex32::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(n)
        .collect();
    fwd.process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex32::new(c.norm_sqr(), 0.0);
    }
    inv.process(&mut buf);

    buf.iter().take(max_lag.min(n)).map(|c| c.re / n as f32).collect()
}

/// Lag with the highest band-weighted correlation inside the tempo range.
fn weighted_prior_lag(acf: &[f32], env_rate: f64) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (lo_bpm, hi_bpm, weight) in TEMPO_BANDS {
        let lo_lag = (env_rate * 60.0 / hi_bpm).ceil() as usize;
        let hi_lag = (env_rate * 60.0 / lo_bpm).floor() as usize;
        for lag in lo_lag.max(1)..=hi_lag.min(acf.len().saturating_sub(2)) {
            // Sum neighbours so a period that falls between two lags is not split.
            let score = (acf[lag - 1] + acf[lag] + acf[lag + 1]) * weight;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((lag, score));
            }
        }
    }
    best.filter(|(_, s)| *s > 0.0).map(|(lag, _)| lag)
}

/// Median spacing of the strongest autocorrelation peaks, with sub-lag precision.
fn candidate_period(acf: &[f32], min_gap: usize, limit: usize) -> Option<f64> {
    let candidates: Vec<(usize, f32)> = (min_gap.max(1)..acf.len().saturating_sub(1))
        .filter(|&i| acf[i] > 0.0 && acf[i] > acf[i - 1] && acf[i] >= acf[i + 1])
        .map(|i| (i, acf[i]))
        .collect();
    let peaks = pick_peaks(candidates, min_gap, limit);
    if peaks.is_empty() {
        return None;
    }

    let refined: Vec<f64> = peaks
        .iter()
        .map(|&(i, _)| i as f64 + parabolic_offset(acf[i - 1], acf[i], acf[i + 1]))
        .collect();

    let mut intervals: Vec<f64> = std::iter::once(0.0)
        .chain(refined.iter().copied())
        .collect::<Vec<_>>()
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d >= min_gap as f64)
        .collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort_by(f64::total_cmp);
    Some(intervals[intervals.len() / 2])
}

fn parabolic_offset(left: f32, centre: f32, right: f32) -> f64 {
    let denom = left - 2.0 * centre + right;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5) as f64
}
