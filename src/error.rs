use std::path::PathBuf;

use thiserror::Error;

use crate::{audio::stems::Stem, scheduler::stem_schedule::ScheduleError};

/// Failures reported by a [`StemSource`](crate::audio::stems::StemSource).
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Track not found: {0}")]
    NotFound(String),

    #[error("Track {track} has no {stem} stem")]
    MissingStem { track: String, stem: Stem },

    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV decode failed for {path}: {message}")]
    Wav { path: PathBuf, message: String },

    /// Every stem decoded to zero samples.
    #[error("Track {0} decoded to an empty buffer")]
    Empty(String),
}

/// Why a transition request was turned away without touching deck state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    TransitionInFlight,
    NoNextTrack,
    /// Queued, but its stems or analysis are still loading.
    NextTrackNotReady,
    NothingPlaying,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictReason::TransitionInFlight => "a transition is already in flight",
            ConflictReason::NoNextTrack => "no next track is queued",
            ConflictReason::NextTrackNotReady => "the next track is still being prepared",
            ConflictReason::NothingPlaying => "the main deck has nothing loaded",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum MixError {
    #[error("Scheduling conflict: {0}")]
    SchedulingConflict(ConflictReason),

    #[error("Stems for {track_id} unavailable: {source}")]
    ResourceUnavailable {
        track_id: String,
        #[source]
        source: LoadError,
    },

    /// Only used internally; callers receive the fallback crossfade instead.
    #[error("No viable transition plan: {0}")]
    NoViablePlan(String),

    #[error("Invalid stem schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("Command queue full")]
    QueueFull,

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error("Orchestrator is not running")]
    Stopped,
}

pub type MixResult<T> = Result<T, MixError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_reason() {
        let err = MixError::SchedulingConflict(ConflictReason::TransitionInFlight);
        assert_eq!(
            err.to_string(),
            "Scheduling conflict: a transition is already in flight"
        );
    }

    #[test]
    fn resource_error_keeps_source() {
        use std::error::Error as _;
        let err = MixError::ResourceUnavailable {
            track_id: "t1".into(),
            source: LoadError::NotFound("t1".into()),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("t1"));
    }
}
