use super::tempo::Onset;
use super::types::{Beat, EnergyCurve};

const BEATS_PER_BAR: usize = 4;
const BARS_PER_PHRASE: usize = 8;
const BARS_PER_SECTION: usize = 32;

/// Onsets this far from a grid point (as a fraction of the beat) are not snapped.
const SNAP_TOLERANCE: f64 = 0.3;
/// Fraction of the strongest onset an onset needs to anchor the grid.
const ANCHOR_STRENGTH: f32 = 0.5;
const UNSNAPPED_CONFIDENCE: f32 = 0.25;

/// Beat grid anchored on the first strong onset, each point snapped to a
/// nearby onset when one exists.
///
/// The grid runs to the end of the track: the last beat is always within one
/// interval of `duration`.
pub fn build_beat_grid(bpm: f64, duration: f64, onsets: &[Onset], energy: &EnergyCurve) -> Vec<Beat> {
    if bpm <= 0.0 || duration <= 0.0 {
        return Vec::new();
    }
    let period = 60.0 / bpm;
    let tolerance = period * SNAP_TOLERANCE;

    let strongest = onsets.iter().map(|o| o.strength).fold(0.0_f32, f32::max);
    let anchor = onsets
        .iter()
        .find(|o| o.strength >= strongest * ANCHOR_STRENGTH && o.time_seconds < duration)
        .map(|o| o.time_seconds)
        .unwrap_or(0.0);

    let mut times: Vec<(f64, f32)> = Vec::new();
    let mut i = 0usize;
    loop {
        let theoretical = anchor + i as f64 * period;
        if theoretical >= duration {
            break;
        }
        let (t, confidence) = match nearest_onset(onsets, theoretical) {
            Some(o) if (o - theoretical).abs() <= tolerance && o < duration => {
                let c = 1.0 - ((o - theoretical).abs() / tolerance) as f32;
                (o, c.max(UNSNAPPED_CONFIDENCE))
            }
            _ => (theoretical, UNSNAPPED_CONFIDENCE),
        };
        // Snapping moves at most 0.3 of a beat, so order holds; guard anyway.
        if times.last().map(|(prev, _)| t > *prev).unwrap_or(true) {
            times.push((t, confidence));
        }
        i += 1;
    }

    // A late-snapped final beat can leave a gap at the end.
    while let Some(&(last, _)) = times.last() {
        if last + period >= duration {
            break;
        }
        times.push((last + period, UNSNAPPED_CONFIDENCE));
    }

    tag_beats(&times, energy)
}

/// Evenly spaced grid from zero over the whole duration.
pub fn synthetic_grid(bpm: f64, duration: f64, energy: &EnergyCurve) -> Vec<Beat> {
    if bpm <= 0.0 || duration <= 0.0 {
        return Vec::new();
    }
    let period = 60.0 / bpm;
    let count = (duration / period).ceil() as usize;
    let times: Vec<(f64, f32)> = (0..count)
        .map(|i| (i as f64 * period, 0.0))
        .filter(|(t, _)| *t < duration)
        .collect();
    tag_beats(&times, energy)
}

fn tag_beats(times: &[(f64, f32)], energy: &EnergyCurve) -> Vec<Beat> {
    times
        .iter()
        .enumerate()
        .map(|(i, &(t, confidence))| Beat {
            time_seconds: t,
            bar_position: (i % BEATS_PER_BAR) as u8 + 1,
            bar_number: (i / BEATS_PER_BAR) as u32 + 1,
            is_downbeat: i % BEATS_PER_BAR == 0,
            is_phrase_start: i % (BEATS_PER_BAR * BARS_PER_PHRASE) == 0,
            is_section_start: i % (BEATS_PER_BAR * BARS_PER_SECTION) == 0,
            confidence,
            estimated_energy: energy.value_at(t),
        })
        .collect()
}

/// Closest onset time; `onsets` must be sorted.
fn nearest_onset(onsets: &[Onset], t: f64) -> Option<f64> {
    let idx = onsets.partition_point(|o| o.time_seconds < t);
    let after = onsets.get(idx).map(|o| o.time_seconds);
    let before = idx.checked_sub(1).and_then(|i| onsets.get(i)).map(|o| o.time_seconds);
    match (before, after) {
        (Some(b), Some(a)) => Some(if t - b <= a - t { b } else { a }),
        (b, a) => b.or(a),
    }
}

/// Nearest grid time to `t`, used to quantize cue and boundary positions.
pub fn quantize(t: f64, grid: &[Beat], downbeats_only: bool) -> f64 {
    grid.iter()
        .filter(|b| !downbeats_only || b.is_downbeat)
        .map(|b| b.time_seconds)
        .min_by(|a, b| (a - t).abs().total_cmp(&(b - t).abs()))
        .unwrap_or(t)
}
