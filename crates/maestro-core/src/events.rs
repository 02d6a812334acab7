use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// The kind of lifecycle event, with any event-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "payload")]
pub enum ProgressEventKind {
    /// A stage is about to execute.
    StageStart,
    /// A partial output chunk (streaming mode only).
    StageProgress(String),
    /// A stage completed successfully.
    StageComplete,
    /// A stage failed terminally.
    StageError(String),
    /// A checkpoint was persisted.
    Checkpoint,
    /// The run is paused awaiting a user decision.
    UserPrompt(String),
}

/// A lifecycle event emitted by the stage execution controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The run this event belongs to.
    pub run_id: String,
    /// Zero-based index of the stage the event refers to.
    pub stage_index: usize,
    /// Name of the stage the event refers to.
    pub stage_name: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Event kind and payload.
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        run_id: impl Into<String>,
        stage_index: usize,
        stage_name: impl Into<String>,
        kind: ProgressEventKind,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage_index,
            stage_name: stage_name.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Receives lifecycle events from the controller.
///
/// `emit` must never block: the controller fires and forgets, but delivery
/// order per run matches emission order. Implementations that buffer must
/// preserve ordering.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event. Implementations must not block the caller.
    fn emit(&self, event: ProgressEvent);
}

/// A sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// A sink backed by a bounded channel, decoupling the controller from slow
/// consumers while preserving per-run ordering. Events are dropped (with a
/// warning) when the consumer falls behind the channel capacity.
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    /// Creates a sink/receiver pair with the given channel capacity.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "progress event dropped: consumer not keeping up");
        }
    }
}
