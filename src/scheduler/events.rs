use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::transition_planner::PlanSummary;
use crate::audio::{deck::DeckId, stems::Stem};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Notifications for the UI layer. Serialized with an `event` tag so a host
/// can forward them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MixEvent {
    #[serde(rename_all = "camelCase")]
    AnalysisReady {
        track_id: String,
        bpm: f64,
        key: String,
        is_fallback: bool,
    },
    #[serde(rename_all = "camelCase")]
    TransitionPlanned { summary: PlanSummary },
    #[serde(rename_all = "camelCase")]
    TransitionStarted {
        outgoing: DeckId,
        incoming: DeckId,
        outgoing_track: String,
        incoming_track: String,
    },
    #[serde(rename_all = "camelCase")]
    TransitionCompleted { new_main_deck: DeckId },
    #[serde(rename_all = "camelCase")]
    StemVolumeChanged { deck: DeckId, stem: Stem, volume: f32 },
    /// A transition was cancelled or could not start.
    #[serde(rename_all = "camelCase")]
    TransitionAborted { reason: String },
}

/// Multi-consumer event fan-out. Sending never blocks and never fails when
/// nobody is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MixEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { tx }
    }

    pub fn emit(&self, event: MixEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MixEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
