/// Transition Orchestrator
///
/// Owns the play queue and drives the other components: asks the analysis
/// worker for upcoming tracks, watches the main deck on the audio clock,
/// plans transitions when the end of a track approaches and hands the plan
/// to the [`MixScheduler`].
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::{
    compatibility::CompatibilityEvaluator,
    events::{EventBus, MixEvent},
    mix_scheduler::{MixScheduler, TickOutcome},
    transition_planner::{
        FallbackReason, PlanSummary, SearchMode, TransitionPlanner, TransitionStyle,
    },
};
use crate::{
    audio::{
        analyzer::{
            AnalysisCache, AnalysisOutcome, AnalysisWorker, TrackAnalysis, TrackAnalyzer, TrackCatalog,
        },
        clock::SampleClock,
        deck::PlaybackState,
        engine::{AudioGraph, RenderHandle},
        stems::{StemSet, StemSource},
    },
    config::EngineConfig,
    error::{ConflictReason, LoadError, MixError, MixResult},
};

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Position polling period; independent of any UI refresh.
    pub poll_interval_ms: u64,
    pub monitor_interval_ms: u64,
    /// Start looking for an exit this long before the main track ends.
    pub trigger_before_end_secs: f64,
    /// Minimum audio-clock time between two automatic planning attempts.
    pub replan_throttle_secs: f64,
    pub cache_capacity: usize,
    pub history_capacity: usize,
    pub auto_transition: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            monitor_interval_ms: 1000,
            trigger_before_end_secs: 30.0,
            replan_throttle_secs: 5.0,
            cache_capacity: 3,
            history_capacity: 50,
            auto_transition: true,
        }
    }
}

// ── History ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    InFlight,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub style: TransitionStyle,
    pub success_probability: f32,
    pub planned_at: DateTime<Utc>,
    pub outcome: TransitionOutcome,
}

/// Most recent transitions, oldest dropped first.
#[derive(Debug, Clone)]
pub struct TransitionHistory {
    capacity: usize,
    records: VecDeque<TransitionRecord>,
}

impl TransitionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: TransitionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn settle_last(&mut self, outcome: TransitionOutcome) {
        if let Some(r) = self
            .records
            .back_mut()
            .filter(|r| r.outcome == TransitionOutcome::InFlight)
        {
            r.outcome = outcome;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&TransitionRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Nothing on the main deck.
    Idle,
    Playing,
    Transitioning,
}

/// Playback position readable from any thread without locking.
#[derive(Debug, Clone, Default)]
pub struct PositionCell(Arc<AtomicU64>);

impl PositionCell {
    pub fn store(&self, secs: f64) {
        self.0.store(secs.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────────

pub struct TransitionOrchestrator {
    config: OrchestratorConfig,
    planner: TransitionPlanner,
    scheduler: MixScheduler,
    analyzer: TrackAnalyzer,
    catalog: Arc<dyn TrackCatalog>,
    cache: AnalysisCache,
    worker: AnalysisWorker,
    outcomes: mpsc::UnboundedReceiver<AnalysisOutcome>,
    queue: VecDeque<String>,
    /// Decoded stems for queued tracks that finished loading.
    ready: HashMap<String, Arc<StemSet>>,
    failed: HashMap<String, LoadError>,
    current: Option<String>,
    incoming: Option<String>,
    last_plan_at: Option<f64>,
    auto_transition: Arc<AtomicBool>,
    position: PositionCell,
    events: EventBus,
    history: TransitionHistory,
}

impl TransitionOrchestrator {
    /// Build every component from `config`. The clock is shared with whoever
    /// calls [`RenderHandle::render`].
    pub fn new(
        config: &EngineConfig,
        source: Arc<dyn StemSource>,
        catalog: Arc<dyn TrackCatalog>,
        clock: SampleClock,
        events: EventBus,
    ) -> Self {
        let analyzer = TrackAnalyzer::new(config.analysis.clone());
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let worker = AnalysisWorker::spawn(source, analyzer.clone(), config.sample_rate, outcome_tx);
        let planner = TransitionPlanner::new(
            config.planner.clone(),
            CompatibilityEvaluator::new(config.compatibility.clone()),
        );
        let scheduler = MixScheduler::new(config.scheduler.clone(), AudioGraph::new(clock), events.clone());
        let o = config.orchestrator.clone();

        Self {
            planner,
            scheduler,
            analyzer,
            catalog,
            cache: AnalysisCache::new(o.cache_capacity),
            worker,
            outcomes,
            queue: VecDeque::new(),
            ready: HashMap::new(),
            failed: HashMap::new(),
            current: None,
            incoming: None,
            last_plan_at: None,
            auto_transition: Arc::new(AtomicBool::new(o.auto_transition)),
            position: PositionCell::default(),
            events,
            history: TransitionHistory::new(o.history_capacity),
            config: o,
        }
    }

    pub fn render_handle(&self) -> RenderHandle {
        self.scheduler.render_handle()
    }

    pub fn scheduler(&self) -> &MixScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn history(&self) -> &TransitionHistory {
        &self.history
    }

    pub fn queue(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    pub fn current_track(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn state(&self) -> OrchestratorState {
        if self.scheduler.is_in_flight() {
            OrchestratorState::Transitioning
        } else if self.current.is_some() {
            OrchestratorState::Playing
        } else {
            OrchestratorState::Idle
        }
    }

    /// Last polled main-deck position.
    pub fn current_position_seconds(&self) -> f64 {
        self.position.load()
    }

    pub fn set_auto_transition(&self, enabled: bool) {
        log::info!("Auto transition {}", if enabled { "enabled" } else { "disabled" });
        self.auto_transition.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_transition(&self) -> bool {
        self.auto_transition.load(Ordering::Relaxed)
    }

    /// Append a track to the queue and start loading it in the background.
    /// The first track queued while idle starts playing once loaded.
    pub fn enqueue(&mut self, track_id: &str) -> MixResult<()> {
        let info = self
            .catalog
            .track_info(track_id)
            .ok_or_else(|| MixError::UnknownTrack(track_id.to_string()))?;

        let analyze = if self.cache.contains(track_id) {
            false
        } else if let Some(cached) = self.catalog.get_cached_analysis(track_id) {
            self.cache.insert(Arc::new(cached));
            false
        } else {
            true
        };
        if !self.ready.contains_key(track_id) {
            self.worker.request(track_id, analyze)?;
        }
        log::info!("Queued {} ({})", info.title, track_id);
        self.queue.push_back(track_id.to_string());
        Ok(())
    }

    /// Remove a queued track, cancelling its analysis if still running.
    pub fn dequeue(&mut self, track_id: &str) -> bool {
        let Some(idx) = self.queue.iter().position(|t| t == track_id) else {
            return false;
        };
        self.queue.remove(idx);
        if !self.queue.iter().any(|t| t == track_id) {
            self.worker.cancel(track_id);
            self.ready.remove(track_id);
            self.failed.remove(track_id);
        }
        true
    }

    /// Collect finished analysis jobs.
    pub fn drain_analysis(&mut self) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            match outcome {
                AnalysisOutcome::Ready { track_id, stems, analysis } => {
                    if let Some(analysis) = analysis {
                        if analysis.is_fallback {
                            log::warn!("Analysis of {track_id} fell back to defaults");
                        }
                        self.catalog.put_cached_analysis(&track_id, analysis.clone());
                        self.cache.insert(Arc::new(analysis));
                    }
                    if let Some(a) = self.cache.get(&track_id) {
                        log::info!(
                            "Analysis ready for {track_id}: {:.1} BPM, {}",
                            a.tempo_bpm,
                            a.key.wheel.code()
                        );
                        self.events.emit(MixEvent::AnalysisReady {
                            track_id: track_id.clone(),
                            bpm: a.tempo_bpm,
                            key: a.key.wheel.code(),
                            is_fallback: a.is_fallback,
                        });
                    }
                    if self.queue.contains(&track_id) {
                        self.ready.insert(track_id, stems);
                    }
                }
                AnalysisOutcome::Failed { track_id, error } => {
                    log::warn!("Track {track_id} cannot be loaded: {error}");
                    if self.queue.contains(&track_id) {
                        self.failed.insert(track_id, error);
                    }
                }
                AnalysisOutcome::Cancelled { track_id } => {
                    log::debug!("Analysis of {track_id} cancelled");
                }
            }
        }
    }

    /// Fixed-rate tick: pull results, advance the scheduler, publish position.
    pub fn on_poll(&mut self) {
        self.drain_analysis();

        match self.scheduler.tick() {
            TickOutcome::Completed { .. } => {
                let prev = std::mem::replace(&mut self.current, self.incoming.take());
                self.release(prev);
                self.history.settle_last(TransitionOutcome::Completed);
                self.last_plan_at = None;
            }
            TickOutcome::InProgress { .. } | TickOutcome::Idle => {}
        }

        if !self.scheduler.is_in_flight() {
            let main = self.scheduler.main_state();
            let finished = matches!(main.playback, PlaybackState::Idle | PlaybackState::Ended);
            if self.current.is_none() || finished {
                self.start_next_directly();
            }
        }
        self.position.store(self.scheduler.main_position());
    }

    /// Coarse tick: plan and start a transition when the main track nears its end.
    pub fn on_monitor(&mut self) {
        if !self.auto_transition() || self.scheduler.is_in_flight() || self.current.is_none() {
            return;
        }
        let main = self.scheduler.main_state();
        let remaining = main.duration_seconds - main.position_seconds;
        if remaining > self.config.trigger_before_end_secs {
            return;
        }
        let now = self.scheduler.now();
        if let Some(last) = self.last_plan_at {
            if now - last < self.config.replan_throttle_secs {
                return;
            }
        }
        let Some(next) = self.queue.front().cloned() else {
            return;
        };
        if !self.ready.contains_key(&next) {
            if let Some(error) = self.failed.remove(&next) {
                log::warn!("Skipping {next}: {error}");
                self.queue.pop_front();
            }
            return;
        }

        self.last_plan_at = Some(now);
        match self.plan_and_execute(SearchMode::Auto) {
            Ok(Some(summary)) => log::debug!("Auto transition scheduled: {summary:?}"),
            Ok(None) => log::debug!("No exit point yet, {remaining:.1}s left"),
            Err(e) => log::warn!("Auto transition failed: {e}"),
        }
    }

    /// Operator-requested transition using the short look-ahead.
    pub fn trigger_manual_transition(&mut self) -> MixResult<PlanSummary> {
        self.drain_analysis();
        if self.scheduler.is_in_flight() {
            return Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight));
        }
        if self.current.is_none() {
            return Err(MixError::SchedulingConflict(ConflictReason::NothingPlaying));
        }
        let next = self
            .queue
            .front()
            .cloned()
            .ok_or(MixError::SchedulingConflict(ConflictReason::NoNextTrack))?;
        if let Some(source) = self.failed.remove(&next) {
            self.queue.pop_front();
            return Err(MixError::ResourceUnavailable { track_id: next, source });
        }
        if !self.ready.contains_key(&next) {
            return Err(MixError::SchedulingConflict(ConflictReason::NextTrackNotReady));
        }
        self.plan_and_execute(SearchMode::Quick)?
            .ok_or_else(|| MixError::NoViablePlan("no exit point".to_string()))
    }

    /// Abort the in-flight transition and put its track back at the head of the queue.
    pub fn cancel_transition(&mut self) -> bool {
        if !self.scheduler.cancel("cancelled by operator") {
            return false;
        }
        if let Some(track) = self.incoming.take() {
            self.queue.push_front(track);
        }
        self.history.settle_last(TransitionOutcome::Aborted);
        true
    }

    fn plan_and_execute(&mut self, mode: SearchMode) -> MixResult<Option<PlanSummary>> {
        let current_id = self
            .current
            .clone()
            .ok_or(MixError::SchedulingConflict(ConflictReason::NothingPlaying))?;
        let next_id = self
            .queue
            .front()
            .cloned()
            .ok_or(MixError::SchedulingConflict(ConflictReason::NoNextTrack))?;
        let stems = self
            .ready
            .get(&next_id)
            .cloned()
            .ok_or(MixError::SchedulingConflict(ConflictReason::NextTrackNotReady))?;

        let main = self.scheduler.main_state();
        let current = self.analysis_for(&current_id, main.duration_seconds);
        let next = self.analysis_for(&next_id, stems.duration_secs());

        let plan = self
            .planner
            .plan(&current, main.position_seconds, Some(&next), mode);
        if plan.fallback_reason == Some(FallbackReason::NoExitPoint) && mode == SearchMode::Auto {
            return Ok(None);
        }
        if plan.is_fallback() {
            let reason = MixError::NoViablePlan(format!("{:?}", plan.fallback_reason));
            log::warn!(
                "{reason}; crossfading {current_id} -> {next_id} over {} ms",
                plan.duration_ms
            );
        }

        let summary = plan.summary();
        self.events.emit(MixEvent::TransitionPlanned {
            summary: summary.clone(),
        });
        if let Err(e) = self.scheduler.execute(&plan, stems) {
            self.events.emit(MixEvent::TransitionAborted { reason: e.to_string() });
            return Err(e);
        }

        self.queue.pop_front();
        self.incoming = Some(next_id.clone());
        self.history.push(TransitionRecord {
            from: current_id,
            to: next_id,
            style: plan.style,
            success_probability: plan.success_probability,
            planned_at: Utc::now(),
            outcome: TransitionOutcome::InFlight,
        });
        Ok(Some(summary))
    }

    /// Hot cache, then the catalog, then defaults.
    fn analysis_for(&mut self, track_id: &str, duration: f64) -> Arc<TrackAnalysis> {
        if let Some(hit) = self.cache.get(track_id) {
            return hit;
        }
        let analysis = match self.catalog.get_cached_analysis(track_id) {
            Some(stored) => Arc::new(stored),
            None => {
                log::warn!("No analysis for {track_id}, planning with defaults");
                Arc::new(self.analyzer.fallback(track_id, duration))
            }
        };
        self.cache.insert(Arc::clone(&analysis));
        analysis
    }

    /// Put the head of the queue on the main deck without a transition.
    fn start_next_directly(&mut self) {
        let Some(next) = self.queue.front().cloned() else {
            return;
        };
        if let Some(error) = self.failed.remove(&next) {
            log::warn!("Skipping {next}: {error}");
            self.queue.pop_front();
            return;
        }
        let Some(stems) = self.ready.get(&next).cloned() else {
            return;
        };
        match self.scheduler.load_main(stems) {
            Ok(()) => {
                self.queue.pop_front();
                let prev = self.current.replace(next);
                self.release(prev);
                self.last_plan_at = None;
            }
            Err(e) => log::warn!("Starting {next} failed: {e}"),
        }
    }

    /// Drop the stems of a track that left the main deck, unless it is queued again.
    fn release(&mut self, track: Option<String>) {
        if let Some(track) = track.filter(|t| !self.queue.contains(t)) {
            self.ready.remove(&track);
        }
    }

    /// Run the polling and monitor loops on the current tokio runtime.
    pub fn spawn(mut self) -> OrchestratorHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<OrchestratorCmd>(32);
        let position = self.position.clone();
        let auto_transition = Arc::clone(&self.auto_transition);
        let events = self.events.clone();
        let render = self.render_handle();

        let poll_ms = self.config.poll_interval_ms.max(1);
        let monitor_ms = self.config.monitor_interval_ms.max(1);
        let task = tokio::spawn(async move {
            let mut poll = interval(Duration::from_millis(poll_ms));
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut monitor = interval(Duration::from_millis(monitor_ms));
            monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = poll.tick() => self.on_poll(),
                    _ = monitor.tick() => self.on_monitor(),
                    cmd = cmd_rx.recv() => match cmd {
                        Some(OrchestratorCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle_cmd(cmd),
                    },
                }
            }
            self.scheduler.cancel("orchestrator shutting down");
            log::info!("Orchestrator stopped");
        });

        OrchestratorHandle {
            cmd_tx,
            position,
            auto_transition,
            events,
            render,
            task: Some(task),
        }
    }

    fn handle_cmd(&mut self, cmd: OrchestratorCmd) {
        match cmd {
            OrchestratorCmd::Enqueue { track_id, reply } => {
                let _ = reply.send(self.enqueue(&track_id));
            }
            OrchestratorCmd::TriggerManual { reply } => {
                let _ = reply.send(self.trigger_manual_transition());
            }
            OrchestratorCmd::Cancel { reply } => {
                let _ = reply.send(self.cancel_transition());
            }
            OrchestratorCmd::History { reply } => {
                let _ = reply.send(self.history.iter().cloned().collect());
            }
            OrchestratorCmd::Shutdown => {}
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

enum OrchestratorCmd {
    Enqueue {
        track_id: String,
        reply: oneshot::Sender<MixResult<()>>,
    },
    TriggerManual {
        reply: oneshot::Sender<MixResult<PlanSummary>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    History {
        reply: oneshot::Sender<Vec<TransitionRecord>>,
    },
    Shutdown,
}

/// Control surface for a spawned orchestrator.
pub struct OrchestratorHandle {
    cmd_tx: mpsc::Sender<OrchestratorCmd>,
    position: PositionCell,
    auto_transition: Arc<AtomicBool>,
    events: EventBus,
    render: RenderHandle,
    task: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn current_position_seconds(&self) -> f64 {
        self.position.load()
    }

    pub fn set_auto_transition(&self, enabled: bool) {
        self.auto_transition.store(enabled, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MixEvent> {
        self.events.subscribe()
    }

    pub fn render_handle(&self) -> RenderHandle {
        self.render.clone()
    }

    pub async fn enqueue(&self, track_id: &str) -> MixResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCmd::Enqueue {
            track_id: track_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| MixError::Stopped)?
    }

    pub async fn trigger_manual_transition(&self) -> MixResult<PlanSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCmd::TriggerManual { reply }).await?;
        rx.await.map_err(|_| MixError::Stopped)?
    }

    pub async fn cancel_transition(&self) -> MixResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCmd::Cancel { reply }).await?;
        rx.await.map_err(|_| MixError::Stopped)
    }

    pub async fn history(&self) -> MixResult<Vec<TransitionRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCmd::History { reply }).await?;
        rx.await.map_err(|_| MixError::Stopped)
    }

    /// Stop the loops and wait for the task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(OrchestratorCmd::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Orchestrator task ended abnormally: {e}");
            }
        }
    }

    async fn send(&self, cmd: OrchestratorCmd) -> MixResult<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| MixError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        analyzer::{tempo::tests::click_track, MemoryCatalog, TrackInfo},
        stems::{Stem, StemBuffer},
    };
    use std::sync::{mpsc as std_mpsc, Mutex};

    const SR: u32 = 8000;
    const TRACK_SECS: f64 = 40.0;

    /// Click-track stems; `missing` fails and `slow` waits for the gate.
    struct ClickSource {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl StemSource for ClickSource {
        fn load_stems(&self, track_id: &str) -> Result<StemSet, LoadError> {
            if track_id == "missing" {
                return Err(LoadError::NotFound(track_id.to_string()));
            }
            if track_id == "slow" {
                let _ = self.gate.lock().unwrap().recv();
            }
            let clicks = click_track(120.0, TRACK_SECS, 0.5, SR);
            Ok(StemSet::new(track_id)
                .with_stem(Stem::Drums, StemBuffer::new(clicks.clone(), SR))
                .with_stem(Stem::Bass, StemBuffer::new(clicks, SR)))
        }
    }

    struct Rig {
        orch: TransitionOrchestrator,
        render: RenderHandle,
        gate: std_mpsc::Sender<()>,
    }

    fn rig(orchestrator: OrchestratorConfig) -> Rig {
        let catalog = Arc::new(MemoryCatalog::new());
        for id in ["a", "b", "c", "slow", "missing"] {
            catalog.add_track(TrackInfo {
                id: id.into(),
                title: id.to_uppercase(),
                duration_seconds: TRACK_SECS,
            });
        }
        let (gate, gate_rx) = std_mpsc::channel();
        let source = Arc::new(ClickSource { gate: Mutex::new(gate_rx) });
        let config = EngineConfig {
            sample_rate: SR,
            orchestrator,
            ..EngineConfig::default()
        };
        let orch = TransitionOrchestrator::new(&config, source, catalog, SampleClock::new(SR), EventBus::new());
        let render = orch.render_handle();
        Rig { orch, render, gate }
    }

    impl Rig {
        /// Render `secs` of audio in 10 ms blocks, polling after each block.
        fn play(&mut self, secs: f64) {
            let mut block = vec![0.0_f32; (SR / 100) as usize * 2];
            let blocks = (secs * 100.0).round() as usize;
            for i in 0..blocks {
                self.render.render(&mut block);
                self.orch.on_poll();
                if (i + 1) % 100 == 0 {
                    self.orch.on_monitor();
                }
            }
        }

        /// Poll in wall-clock time until `done` holds.
        fn wait_for(&mut self, mut done: impl FnMut(&TransitionOrchestrator) -> bool) {
            for _ in 0..2000 {
                self.orch.on_poll();
                if done(&self.orch) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("condition not reached");
        }
    }

    #[test]
    fn unknown_track_is_rejected() {
        let mut r = rig(OrchestratorConfig::default());
        assert!(matches!(r.orch.enqueue("nope"), Err(MixError::UnknownTrack(_))));
        assert_eq!(r.orch.queue().count(), 0);
    }

    #[test]
    fn manual_trigger_conflicts() {
        let mut r = rig(OrchestratorConfig {
            auto_transition: false,
            ..OrchestratorConfig::default()
        });
        assert!(matches!(
            r.orch.trigger_manual_transition(),
            Err(MixError::SchedulingConflict(ConflictReason::NothingPlaying))
        ));

        r.orch.enqueue("a").unwrap();
        r.wait_for(|o| o.current_track() == Some("a"));
        assert_eq!(r.orch.state(), OrchestratorState::Playing);
        assert!(matches!(
            r.orch.trigger_manual_transition(),
            Err(MixError::SchedulingConflict(ConflictReason::NoNextTrack))
        ));

        r.orch.enqueue("slow").unwrap();
        assert!(matches!(
            r.orch.trigger_manual_transition(),
            Err(MixError::SchedulingConflict(ConflictReason::NextTrackNotReady))
        ));
        r.gate.send(()).unwrap();
        r.wait_for(|o| o.ready.contains_key("slow"));

        r.orch.trigger_manual_transition().unwrap();
        assert!(matches!(
            r.orch.trigger_manual_transition(),
            Err(MixError::SchedulingConflict(ConflictReason::TransitionInFlight))
        ));
    }

    #[test]
    fn failed_load_surfaces_as_resource_error() {
        let mut r = rig(OrchestratorConfig {
            auto_transition: false,
            ..OrchestratorConfig::default()
        });
        r.orch.enqueue("a").unwrap();
        r.orch.enqueue("missing").unwrap();
        r.wait_for(|o| o.current_track() == Some("a") && o.failed.contains_key("missing"));

        let err = r.orch.trigger_manual_transition();
        assert!(matches!(
            err,
            Err(MixError::ResourceUnavailable { ref track_id, .. }) if track_id == "missing"
        ));
        assert_eq!(r.orch.queue().count(), 0);
        assert_eq!(r.orch.state(), OrchestratorState::Playing);
    }

    #[test]
    fn manual_transition_completes_and_swaps_decks() {
        let mut r = rig(OrchestratorConfig {
            auto_transition: false,
            ..OrchestratorConfig::default()
        });
        let mut events = r.orch.events().subscribe();
        r.orch.enqueue("a").unwrap();
        r.orch.enqueue("b").unwrap();
        r.wait_for(|o| o.current_track() == Some("a") && o.ready.contains_key("b"));
        let main_before = r.orch.scheduler().main_deck();

        r.play(5.0);
        assert!((r.orch.current_position_seconds() - 5.0).abs() < 0.02);

        let summary = r.orch.trigger_manual_transition().unwrap();
        assert!(summary.exit_seconds >= 5.0 && summary.exit_seconds <= 9.0 + 1e-9);
        assert_eq!(r.orch.state(), OrchestratorState::Transitioning);
        r.play(15.0);

        assert_eq!(r.orch.state(), OrchestratorState::Playing);
        assert_eq!(r.orch.current_track(), Some("b"));
        assert_eq!(r.orch.scheduler().main_deck(), main_before.other());
        let record = r.orch.history().last().unwrap();
        assert_eq!((record.from.as_str(), record.to.as_str()), ("a", "b"));
        assert_eq!(record.outcome, TransitionOutcome::Completed);

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            let name = serde_json::to_value(&ev).unwrap()["event"].as_str().unwrap().to_string();
            if !kinds.contains(&name) {
                kinds.push(name);
            }
        }
        for expected in ["analysisReady", "transitionPlanned", "transitionStarted", "stemVolumeChanged", "transitionCompleted"] {
            assert!(kinds.iter().any(|k| k == expected), "missing {expected} in {kinds:?}");
        }
    }

    #[test]
    fn cancel_requeues_the_incoming_track() {
        let mut r = rig(OrchestratorConfig {
            auto_transition: false,
            ..OrchestratorConfig::default()
        });
        r.orch.enqueue("a").unwrap();
        r.orch.enqueue("b").unwrap();
        r.wait_for(|o| o.current_track() == Some("a") && o.ready.contains_key("b"));
        r.orch.trigger_manual_transition().unwrap();
        assert!(r.orch.cancel_transition());
        assert_eq!(r.orch.queue().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(r.orch.current_track(), Some("a"));
        assert_eq!(r.orch.history().last().unwrap().outcome, TransitionOutcome::Aborted);
        assert!(!r.orch.cancel_transition());
    }

    #[test]
    fn monitor_transitions_before_the_track_ends() {
        let mut r = rig(OrchestratorConfig::default());
        r.orch.enqueue("a").unwrap();
        r.orch.enqueue("b").unwrap();
        r.wait_for(|o| o.current_track() == Some("a") && o.ready.contains_key("b"));

        r.play(TRACK_SECS - 1.0);
        assert_eq!(r.orch.history().len(), 1);
        assert_eq!(r.orch.current_track(), Some("b"));

        r.orch.set_auto_transition(false);
        assert!(!r.orch.auto_transition());
    }

    #[test]
    fn history_is_bounded() {
        let mut h = TransitionHistory::new(2);
        for i in 0..3 {
            h.push(TransitionRecord {
                from: format!("t{i}"),
                to: format!("t{}", i + 1),
                style: TransitionStyle::AdaptiveCrossfade,
                success_probability: 0.5,
                planned_at: Utc::now(),
                outcome: TransitionOutcome::InFlight,
            });
        }
        assert_eq!(h.len(), 2);
        assert_eq!(h.iter().next().unwrap().from, "t1");
        h.settle_last(TransitionOutcome::Completed);
        h.settle_last(TransitionOutcome::Aborted);
        assert_eq!(h.last().unwrap().outcome, TransitionOutcome::Completed);
    }

    #[tokio::test]
    async fn spawned_orchestrator_answers_commands() {
        let r = rig(OrchestratorConfig {
            poll_interval_ms: 5,
            ..OrchestratorConfig::default()
        });
        let handle = r.orch.spawn();
        assert!(matches!(handle.enqueue("nope").await, Err(MixError::UnknownTrack(_))));
        handle.enqueue("a").await.unwrap();
        assert!(matches!(
            handle.trigger_manual_transition().await,
            Err(MixError::SchedulingConflict(_))
        ));
        assert!(!handle.cancel_transition().await.unwrap());
        assert!(handle.history().await.unwrap().is_empty());
        handle.set_auto_transition(false);
        assert!(handle.current_position_seconds() >= 0.0);
        handle.shutdown().await;
    }
}
