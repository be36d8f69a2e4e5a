use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use dasp::{interpolate::linear::Linear, signal, Signal};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

// ── Stem ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl Stem {
    pub const ALL: [Stem; 4] = [Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Stem::Vocals => 0,
            Stem::Drums => 1,
            Stem::Bass => 2,
            Stem::Other => 3,
        }
    }

    /// Map a separator output file stem (`vocals.wav` → `vocals`) to a [`Stem`].
    /// Two-stem separations write `no_vocals`, which we treat as `Other`.
    pub fn from_file_stem(name: &str) -> Option<Self> {
        match name {
            "vocals" => Some(Stem::Vocals),
            "drums" => Some(Stem::Drums),
            "bass" => Some(Stem::Bass),
            "other" | "no_vocals" | "instrumental" => Some(Stem::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Mono PCM for one stem.
#[derive(Debug, Clone)]
pub struct StemBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl StemBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Sample at a track position in seconds, or silence past either end.
    #[inline]
    pub fn sample_at(&self, position_secs: f64) -> f32 {
        if position_secs < 0.0 {
            return 0.0;
        }
        let idx = (position_secs * self.sample_rate as f64) as usize;
        self.samples.get(idx).copied().unwrap_or(0.0)
    }

    fn resampled(self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate || self.sample_rate == 0 || self.samples.is_empty() {
            return self;
        }
        let out_len =
            (self.samples.len() as u64 * target_rate as u64 / self.sample_rate as u64) as usize;
        let mut source = signal::from_iter(self.samples.iter().map(|&s| [s]));
        let a = source.next();
        let b = source.next();
        let interp = Linear::new(a, b);
        let samples = source
            .from_hz_to_hz(interp, self.sample_rate as f64, target_rate as f64)
            .take(out_len)
            .map(|f| f[0])
            .collect();
        Self {
            samples,
            sample_rate: target_rate,
        }
    }
}

/// All decoded stems of one track.
#[derive(Debug, Clone)]
pub struct StemSet {
    pub track_id: String,
    stems: BTreeMap<Stem, StemBuffer>,
}

impl StemSet {
    pub fn new(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            stems: BTreeMap::new(),
        }
    }

    pub fn with_stem(mut self, stem: Stem, buffer: StemBuffer) -> Self {
        self.insert(stem, buffer);
        self
    }

    pub fn insert(&mut self, stem: Stem, buffer: StemBuffer) {
        self.stems.insert(stem, buffer);
    }

    pub fn get(&self, stem: Stem) -> Option<&StemBuffer> {
        self.stems.get(&stem)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stem, &StemBuffer)> {
        self.stems.iter().map(|(s, b)| (*s, b))
    }

    pub fn is_empty(&self) -> bool {
        self.stems.values().all(|b| b.samples.is_empty())
    }

    pub fn sample_rate(&self) -> u32 {
        self.stems.values().map(|b| b.sample_rate).next().unwrap_or(0)
    }

    /// Longest stem wins; separators occasionally trim trailing silence.
    pub fn duration_secs(&self) -> f64 {
        self.stems
            .values()
            .map(StemBuffer::duration_secs)
            .fold(0.0, f64::max)
    }

    /// Sum of all stems at the set's sample rate.
    pub fn mixdown(&self) -> Vec<f32> {
        let len = self.stems.values().map(|b| b.samples.len()).max().unwrap_or(0);
        let mut out = vec![0.0_f32; len];
        for buf in self.stems.values() {
            for (o, &s) in out.iter_mut().zip(buf.samples.iter()) {
                *o += s;
            }
        }
        out
    }

    /// Bring every stem to `target_rate`.
    pub fn resampled(self, target_rate: u32) -> Self {
        let needs = self.stems.values().any(|b| b.sample_rate != target_rate);
        if !needs {
            return self;
        }
        log::warn!(
            "Resampling stems of {} from {} Hz to {} Hz",
            self.track_id,
            self.sample_rate(),
            target_rate
        );
        Self {
            track_id: self.track_id,
            stems: self
                .stems
                .into_iter()
                .map(|(s, b)| (s, b.resampled(target_rate)))
                .collect(),
        }
    }
}

// ── Stem source ─────────────────────────────────────────────────────────────

/// Supplies decoded per-stem PCM for a track identifier.
pub trait StemSource: Send + Sync {
    fn load_stems(&self, track_id: &str) -> Result<StemSet, LoadError>;
}

/// Reads separator output from `<root>/<track_id>/**/{vocals,drums,bass,other}.wav`.
///
/// When several model folders exist for the same track the most recently
/// written one is used.
pub struct WavStemSource {
    root: PathBuf,
}

impl WavStemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve_stem_dir(&self, track_id: &str) -> Result<BTreeMap<Stem, PathBuf>, LoadError> {
        let track_root = self.root.join(track_id);
        if !track_root.is_dir() {
            return Err(LoadError::NotFound(track_id.to_string()));
        }

        let mut stack = vec![track_root];
        let mut best: Option<(BTreeMap<Stem, PathBuf>, SystemTime)> = None;

        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mut found = BTreeMap::new();
            let mut newest = SystemTime::UNIX_EPOCH;

            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let is_wav = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("wav"))
                    .unwrap_or(false);
                if !is_wav {
                    continue;
                }
                let Some(stem) = path
                    .file_stem()
                    .and_then(|n| n.to_str())
                    .and_then(Stem::from_file_stem)
                else {
                    continue;
                };
                let mtime = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                newest = newest.max(mtime);
                found.insert(stem, path);
            }

            if found.is_empty() {
                continue;
            }
            let replace = best
                .as_ref()
                .map(|(prev, t)| found.len() > prev.len() || (found.len() == prev.len() && newest > *t))
                .unwrap_or(true);
            if replace {
                best = Some((found, newest));
            }
        }

        best.map(|(m, _)| m)
            .ok_or_else(|| LoadError::Empty(track_id.to_string()))
    }
}

impl StemSource for WavStemSource {
    fn load_stems(&self, track_id: &str) -> Result<StemSet, LoadError> {
        let paths = self.resolve_stem_dir(track_id)?;
        let mut set = StemSet::new(track_id);
        for (stem, path) in paths {
            set.insert(stem, read_wav_mono(&path)?);
        }
        if set.is_empty() {
            return Err(LoadError::Empty(track_id.to_string()));
        }
        Ok(set)
    }
}

fn read_wav_mono(path: &Path) -> Result<StemBuffer, LoadError> {
    let wav_err = |e: hound::Error| match e {
        hound::Error::IoError(source) => LoadError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => LoadError::Wav {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    };

    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let norm = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * norm))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(StemBuffer::new(samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            w.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn loads_nested_separator_output() {
        let dir = tempfile::tempdir().unwrap();
        let stem_dir = dir.path().join("track-1").join("htdemucs");
        fs::create_dir_all(&stem_dir).unwrap();
        write_wav(&stem_dir.join("vocals.wav"), &[0.5; 100], 8000, 1);
        write_wav(&stem_dir.join("drums.wav"), &[0.25; 200], 8000, 1);
        write_wav(&stem_dir.join("notes.wav"), &[0.1; 10], 8000, 1);

        let source = WavStemSource::new(dir.path());
        let set = source.load_stems("track-1").unwrap();
        assert_eq!(set.sample_rate(), 8000);
        assert!(set.get(Stem::Vocals).is_some());
        assert!(set.get(Stem::Bass).is_none());
        assert!((set.duration_secs() - 0.025).abs() < 1e-9);
        let v = set.get(Stem::Vocals).unwrap().samples[0];
        assert!((v - 0.5).abs() < 1e-3, "unexpected sample {v}");
    }

    #[test]
    fn stereo_is_folded_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let stem_dir = dir.path().join("t");
        fs::create_dir_all(&stem_dir).unwrap();
        write_wav(&stem_dir.join("other.wav"), &[0.5, 0.0, 0.5, 0.0], 8000, 2);

        let set = WavStemSource::new(dir.path()).load_stems("t").unwrap();
        let buf = set.get(Stem::Other).unwrap();
        assert_eq!(buf.samples.len(), 2);
        assert!((buf.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn missing_track_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = WavStemSource::new(dir.path()).load_stems("nope").unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn empty_track_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("blank")).unwrap();
        let err = WavStemSource::new(dir.path()).load_stems("blank").unwrap_err();
        assert!(matches!(err, LoadError::Empty(_)));
    }

    #[test]
    fn resampling_scales_length() {
        let set = StemSet::new("x").with_stem(Stem::Bass, StemBuffer::new(vec![0.1; 22050], 22050));
        let out = set.resampled(44100);
        let buf = out.get(Stem::Bass).unwrap();
        assert_eq!(buf.sample_rate, 44100);
        assert_eq!(buf.samples.len(), 44100);
    }

    #[test]
    fn mixdown_sums_stems() {
        let set = StemSet::new("x")
            .with_stem(Stem::Bass, StemBuffer::new(vec![0.25; 4], 10))
            .with_stem(Stem::Drums, StemBuffer::new(vec![0.5; 2], 10));
        assert_eq!(set.mixdown(), vec![0.75, 0.75, 0.25, 0.25]);
    }
}
