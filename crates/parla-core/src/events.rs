//! Typed event channel from the core to the boundary.
//!
//! The UI (overlay, status panel, history view) subscribes here; the core
//! never calls into it. Events are broadcast so any number of observers
//! can attach, and a lagging observer only loses its own backlog.

use crate::history::HistoryItem;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Session lifecycle phase shown by the floating status overlay.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Recording,
    Transcribing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session: Uuid,
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Progress of a local-service lifecycle operation (install, download,
/// verify, ...). Percent is monotonically non-decreasing per operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProgress {
    pub stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PipelineEvent {
    Status(StatusUpdate),
    ServiceProgress(ServiceProgress),
    History(HistoryItem),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: emitting with no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit_status(&self, session: Uuid, phase: SessionPhase, detail: Option<String>) {
        self.emit(PipelineEvent::Status(StatusUpdate {
            session,
            phase,
            detail,
        }));
    }

    pub fn emit_progress(
        &self,
        stage: &str,
        message: &str,
        percent: Option<u8>,
        detail: Option<String>,
    ) {
        self.emit(PipelineEvent::ServiceProgress(ServiceProgress {
            stage: stage.to_string(),
            message: message.to_string(),
            percent,
            detail,
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
