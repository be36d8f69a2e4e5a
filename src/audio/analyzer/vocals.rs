use super::{
    structure::energy_curve,
    types::{VocalActivity, VocalSegment},
    AnalysisConfig,
};
use crate::audio::stems::StemBuffer;

/// Absolute floor for the presence threshold, so a mostly silent vocal stem
/// does not treat breath noise as singing.
const MIN_THRESHOLD: f32 = 0.1;

/// Vocal energy curve plus the sustained regions above the configured percentile.
pub fn vocal_activity(
    vocals: Option<&StemBuffer>,
    duration: f64,
    config: &AnalysisConfig,
) -> VocalActivity {
    let window = config.vocal_window_secs;
    let Some(buf) = vocals.filter(|b| !b.samples.is_empty()) else {
        return VocalActivity::silent(duration, window);
    };

    let curve = energy_curve(&buf.samples, buf.sample_rate, window);
    if curve.values.iter().all(|&v| v <= 1e-6) {
        return VocalActivity::silent(duration, window);
    }

    let threshold = percentile(&curve.values, config.vocal_percentile).max(MIN_THRESHOLD);
    let min_windows = (config.min_vocal_segment_secs / window).ceil() as usize;

    let mut segments = Vec::new();
    let mut run_start: Option<usize> = None;
    for i in 0..=curve.values.len() {
        let active = curve.values.get(i).map(|&v| v >= threshold).unwrap_or(false);
        match (active, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                if i - s >= min_windows {
                    segments.push(VocalSegment {
                        start_seconds: s as f64 * window,
                        end_seconds: (i as f64 * window).min(duration),
                    });
                }
                run_start = None;
            }
            _ => {}
        }
    }

    VocalActivity { curve, segments }
}

fn percentile(values: &[f32], p: f32) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let idx = ((sorted.len() - 1) as f32 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}
