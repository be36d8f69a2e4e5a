use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread,
};

use tokio::sync::mpsc::UnboundedSender;

use super::{types::TrackAnalysis, TrackAnalyzer};
use crate::{
    audio::stems::{StemSet, StemSource},
    error::{LoadError, MixError, MixResult},
};

const JOB_QUEUE_SIZE: usize = 16;

struct AnalysisJob {
    track_id: String,
    /// `false` when the analysis is already cached and only the stems are needed.
    analyze: bool,
    cancel: Arc<AtomicBool>,
}

/// Result of one job, delivered to the orchestrator over its channel.
#[derive(Debug)]
pub enum AnalysisOutcome {
    Ready {
        track_id: String,
        stems: Arc<StemSet>,
        analysis: Option<TrackAnalysis>,
    },
    Failed {
        track_id: String,
        error: LoadError,
    },
    Cancelled {
        track_id: String,
    },
}

impl AnalysisOutcome {
    pub fn track_id(&self) -> &str {
        match self {
            AnalysisOutcome::Ready { track_id, .. }
            | AnalysisOutcome::Failed { track_id, .. }
            | AnalysisOutcome::Cancelled { track_id } => track_id,
        }
    }
}

/// Loads and analyzes tracks on a dedicated thread.
///
/// Nothing is shared with the caller except the job queue, the outcome
/// channel and per-job cancel flags.
pub struct AnalysisWorker {
    job_tx: SyncSender<AnalysisJob>,
    pending: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl AnalysisWorker {
    pub fn spawn(
        source: Arc<dyn StemSource>,
        analyzer: TrackAnalyzer,
        sample_rate: u32,
        outcome_tx: UnboundedSender<AnalysisOutcome>,
    ) -> Self {
        let (job_tx, job_rx) = sync_channel(JOB_QUEUE_SIZE);
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let worker_pending = Arc::clone(&pending);
        if let Err(e) = thread::Builder::new()
            .name("analysis-worker".to_string())
            .spawn(move || run(job_rx, source, analyzer, sample_rate, outcome_tx, worker_pending))
        {
            log::warn!("Failed to spawn analysis worker: {e}");
        }

        Self { job_tx, pending }
    }

    /// Queue a track. A request for a track already in the queue is ignored.
    pub fn request(&self, track_id: &str, analyze: bool) -> MixResult<()> {
        let cancel = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.contains_key(track_id) {
                return Ok(());
            }
            let flag = Arc::new(AtomicBool::new(false));
            pending.insert(track_id.to_string(), Arc::clone(&flag));
            flag
        };

        let job = AnalysisJob {
            track_id: track_id.to_string(),
            analyze,
            cancel,
        };
        match self.job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.forget(track_id);
                match e {
                    TrySendError::Full(_) => Err(MixError::QueueFull),
                    TrySendError::Disconnected(_) => Err(MixError::Stopped),
                }
            }
        }
    }

    /// Ask the worker to drop a queued or running job. Returns `false` if the
    /// track was not pending.
    pub fn cancel(&self, track_id: &str) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        match pending.get(track_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, track_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(track_id)
    }

    fn forget(&self, track_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(track_id);
    }
}

fn run(
    job_rx: Receiver<AnalysisJob>,
    source: Arc<dyn StemSource>,
    analyzer: TrackAnalyzer,
    sample_rate: u32,
    outcome_tx: UnboundedSender<AnalysisOutcome>,
    pending: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
) {
    while let Ok(job) = job_rx.recv() {
        let outcome = process(&job, source.as_ref(), &analyzer, sample_rate);
        pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job.track_id);
        if outcome_tx.send(outcome).is_err() {
            break;
        }
    }
    log::debug!("Analysis worker exiting");
}

fn process(
    job: &AnalysisJob,
    source: &dyn StemSource,
    analyzer: &TrackAnalyzer,
    sample_rate: u32,
) -> AnalysisOutcome {
    let track_id = job.track_id.clone();
    if job.cancel.load(Ordering::Relaxed) {
        return AnalysisOutcome::Cancelled { track_id };
    }

    let stems = match source.load_stems(&track_id) {
        Ok(s) => s.resampled(sample_rate),
        Err(error) => {
            log::warn!("Loading stems for {track_id} failed: {error}");
            return AnalysisOutcome::Failed { track_id, error };
        }
    };

    let analysis = if job.analyze {
        match analyzer.analyze_cancellable(&stems, &job.cancel) {
            Some(a) => Some(a),
            None => return AnalysisOutcome::Cancelled { track_id },
        }
    } else {
        None
    };

    AnalysisOutcome::Ready {
        track_id,
        stems: Arc::new(stems),
        analysis,
    }
}
