use super::{
    beatgrid::quantize,
    types::{Beat, EnergyCurve, Section, SectionKind},
    AnalysisConfig,
};

/// Below this level adjacent windows are too quiet for a ratio to mean anything.
const ENERGY_FLOOR: f32 = 0.05;
const BREAKDOWN_RATIO: f32 = 0.7;

/// RMS per window, normalized so the loudest window is 1.0.
pub fn energy_curve(samples: &[f32], sample_rate: u32, window_secs: f64) -> EnergyCurve {
    let window = ((sample_rate as f64 * window_secs) as usize).max(1);
    let mut values: Vec<f32> = samples
        .chunks(window)
        .map(|chunk| (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt())
        .collect();

    let peak = values.iter().cloned().fold(0.0_f32, f32::max);
    if peak > 1e-9 {
        for v in values.iter_mut() {
            *v /= peak;
        }
    }
    EnergyCurve {
        window_seconds: window_secs,
        values,
    }
}

/// Split `[0, duration)` into labelled sections.
///
/// Intro and outro boundaries are always placed; energy jumps add further
/// boundaries as long as they keep `min_boundary_spacing_secs` from every
/// accepted boundary and from both ends of the track. All boundaries sit on
/// downbeats when the grid has any.
pub fn segment(
    energy: &EnergyCurve,
    grid: &[Beat],
    duration: f64,
    config: &AnalysisConfig,
) -> Vec<Section> {
    if duration <= 0.0 {
        return Vec::new();
    }
    let snap = |t: f64| quantize(t, grid, true);
    let spacing = config.min_boundary_spacing_secs;

    let intro_end = snap(duration * config.intro_fraction);
    let outro_start = snap(duration * config.outro_fraction);

    let mut boundaries: Vec<f64> = Vec::new();
    for forced in [intro_end, outro_start] {
        if forced > 0.0 && forced < duration && !boundaries.contains(&forced) {
            boundaries.push(forced);
        }
    }

    for t in energy_jumps(energy, config.boundary_change_ratio) {
        let t = snap(t);
        let clear_of_ends = t >= spacing && duration - t >= spacing;
        let clear_of_others = boundaries.iter().all(|b| (b - t).abs() >= spacing);
        if clear_of_ends && clear_of_others {
            boundaries.push(t);
        }
    }
    boundaries.sort_by(f64::total_cmp);

    let track_mean = energy.mean();
    let mut edges = Vec::with_capacity(boundaries.len() + 2);
    edges.push(0.0);
    edges.extend(boundaries);
    edges.push(duration);

    let mut sections: Vec<Section> = Vec::new();
    let mut next_body = SectionKind::Verse;
    for w in edges.windows(2) {
        let (start, end) = (w[0], w[1]);
        let average_energy = energy.mean_between(start, end);
        let kind = if start < intro_end {
            SectionKind::Intro
        } else if start >= outro_start {
            SectionKind::Outro
        } else if track_mean > 0.0 && average_energy < track_mean * BREAKDOWN_RATIO {
            SectionKind::Breakdown
        } else {
            let k = next_body;
            next_body = match k {
                SectionKind::Verse => SectionKind::Chorus,
                _ => SectionKind::Verse,
            };
            k
        };

        match sections.last_mut() {
            Some(prev) if prev.kind == kind => {
                let total = end - prev.start_seconds;
                let prev_len = prev.end_seconds - prev.start_seconds;
                if total > 0.0 {
                    prev.average_energy = ((prev.average_energy as f64 * prev_len
                        + average_energy as f64 * (end - start))
                        / total) as f32;
                }
                prev.end_seconds = end;
            }
            _ => sections.push(Section {
                kind,
                start_seconds: start,
                end_seconds: end,
                average_energy,
            }),
        }
    }
    sections
}

/// Window start times where energy changes by more than `ratio` relative to
/// the previous window.
fn energy_jumps(energy: &EnergyCurve, ratio: f32) -> Vec<f64> {
    energy
        .values
        .windows(2)
        .enumerate()
        .filter(|(_, w)| {
            let (prev, cur) = (w[0], w[1]);
            prev.max(cur) >= ENERGY_FLOOR && (cur - prev).abs() / prev.max(1e-3) > ratio
        })
        .map(|(i, _)| (i + 1) as f64 * energy.window_seconds)
        .collect()
}
