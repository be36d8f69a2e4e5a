use serde::{Deserialize, Serialize};

use super::key::MusicalKey;

// ── Beat grid ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    pub time_seconds: f64,
    /// 1..=4
    pub bar_position: u8,
    /// 1-based
    pub bar_number: u32,
    pub is_downbeat: bool,
    /// First beat of an 8-bar phrase.
    pub is_phrase_start: bool,
    /// First beat of a 32-bar section.
    pub is_section_start: bool,
    pub confidence: f32,
    pub estimated_energy: f32,
}

// ── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Intro,
    Verse,
    Chorus,
    Breakdown,
    Outro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// 0..1 relative to the loudest window of the track.
    pub average_energy: f32,
}

impl Section {
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_seconds && t < self.end_seconds
    }
}

// ── Curves ──────────────────────────────────────────────────────────────────

/// Fixed-window curve normalized to 0..1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCurve {
    pub window_seconds: f64,
    pub values: Vec<f32>,
}

impl EnergyCurve {
    pub fn flat(duration: f64, window_seconds: f64, level: f32) -> Self {
        let n = (duration / window_seconds).ceil().max(0.0) as usize;
        Self {
            window_seconds,
            values: vec![level; n],
        }
    }

    pub fn value_at(&self, t: f64) -> f32 {
        if self.values.is_empty() || self.window_seconds <= 0.0 || t < 0.0 {
            return 0.0;
        }
        let idx = ((t / self.window_seconds) as usize).min(self.values.len() - 1);
        self.values[idx]
    }

    /// Mean over `[start, end)`; falls back to the point value for tiny spans.
    pub fn mean_between(&self, start: f64, end: f64) -> f32 {
        if self.values.is_empty() || self.window_seconds <= 0.0 {
            return 0.0;
        }
        let a = ((start.max(0.0) / self.window_seconds) as usize).min(self.values.len() - 1);
        let b = ((end.max(0.0) / self.window_seconds).ceil() as usize).min(self.values.len());
        if b <= a {
            return self.values[a];
        }
        self.values[a..b].iter().sum::<f32>() / (b - a) as f32
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VocalSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

/// Vocal stem energy per window plus the regions where a voice is clearly present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocalActivity {
    pub curve: EnergyCurve,
    pub segments: Vec<VocalSegment>,
}

impl VocalActivity {
    pub fn silent(duration: f64, window_seconds: f64) -> Self {
        Self {
            curve: EnergyCurve::flat(duration, window_seconds, 0.0),
            segments: Vec::new(),
        }
    }

    pub fn is_active_at(&self, t: f64) -> bool {
        self.segments
            .iter()
            .any(|s| t >= s.start_seconds && t < s.end_seconds)
    }

    pub fn first_entry(&self) -> Option<f64> {
        self.segments.first().map(|s| s.start_seconds)
    }

    /// Every point where a voice enters or drops out.
    pub fn transitions(&self) -> impl Iterator<Item = f64> + '_ {
        self.segments
            .iter()
            .flat_map(|s| [s.start_seconds, s.end_seconds])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CuePoints {
    pub cue_in_seconds: f64,
    pub cue_out_seconds: f64,
}

// ── TrackAnalysis ───────────────────────────────────────────────────────────

/// Everything the planner needs to know about one track. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackAnalysis {
    pub track_id: String,
    pub tempo_bpm: f64,
    pub tempo_confidence: f32,
    pub key: MusicalKey,
    pub beat_grid: Vec<Beat>,
    pub sections: Vec<Section>,
    pub duration_seconds: f64,
    pub energy_curve: EnergyCurve,
    pub vocal_activity: VocalActivity,
    pub cue_points: CuePoints,
    /// Set when any stage fell back to defaults.
    pub is_fallback: bool,
}

impl TrackAnalysis {
    pub fn beat_interval(&self) -> f64 {
        if self.tempo_bpm > 0.0 {
            60.0 / self.tempo_bpm
        } else {
            0.5
        }
    }

    pub fn section_at(&self, t: f64) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.contains(t))
            .or_else(|| self.sections.last().filter(|s| t >= s.end_seconds))
    }

    /// Nearest downbeat to `t`, if the grid has any.
    pub fn nearest_downbeat(&self, t: f64) -> Option<f64> {
        nearest_time(self.beat_grid.iter().filter(|b| b.is_downbeat), t)
    }

    pub fn nearest_beat(&self, t: f64) -> Option<f64> {
        nearest_time(self.beat_grid.iter(), t)
    }

    pub fn beats_between(&self, start: f64, end: f64) -> impl Iterator<Item = &Beat> {
        let from = self.beat_grid.partition_point(|b| b.time_seconds < start);
        self.beat_grid[from..]
            .iter()
            .take_while(move |b| b.time_seconds <= end)
    }
}

fn nearest_time<'a>(beats: impl Iterator<Item = &'a Beat>, t: f64) -> Option<f64> {
    beats
        .map(|b| b.time_seconds)
        .min_by(|a, b| (a - t).abs().total_cmp(&(b - t).abs()))
}
