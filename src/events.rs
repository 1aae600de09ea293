//! # Events
//!
//! Payloads the engine emits at the boundaries external subscribers
//! care about (spec.md §6). The event bus transport itself is out of
//! scope (spec.md §1); [`EventSink`] is the seam a caller wires to
//! whatever transport they have (gateway bus, in-process channel, log).

use serde::{Deserialize, Serialize};

use crate::upload::Executant;

/// Outcome of C10's post-processing run, as reported to C9 and onward
/// to [`UploadReady`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessingOutcome {
    Continue,
    Abort,
    Delete,
}

/// Emitted when a PATCH (chunk write) completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BytesReceived {
    pub upload_id: String,
    pub space_id: String,
    pub offset: u64,
    pub executant: Executant,
}

/// Emitted when post-processing completes, success or failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadReady {
    pub upload_id: String,
    pub space_id: String,
    pub node_id: Option<String>,
    pub failed: bool,
    pub executant: Executant,
    pub space_owner_id: Option<String>,
}

/// Input trigger asking the pipeline to resume a checkpointed session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestartPostprocessing {
    pub upload_id: String,
}

/// Input trigger reporting the overall pipeline outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostprocessingFinished {
    pub upload_id: String,
    pub outcome: PostprocessingOutcome,
}

/// Emitted after an individual step (typically `scanning`) completes,
/// ahead of the full pipeline finishing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostprocessingStepFinished {
    pub upload_id: String,
    pub step_name: String,
    pub succeeded: bool,
}

/// Any event this crate can emit, for callers that want one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    BytesReceived(BytesReceived),
    UploadReady(UploadReady),
    RestartPostprocessing(RestartPostprocessing),
    PostprocessingFinished(PostprocessingFinished),
    PostprocessingStepFinished(PostprocessingStepFinished),
}

/// Destination for emitted events. `async-trait` so implementations can
/// forward to an async transport (queue publish, HTTP callback) without
/// the engine blocking on it synchronously.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Sink that just logs events via `tracing`, useful as a default when no
/// real event bus is wired up.
pub struct LoggingEventSink;

#[async_trait::async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: Event) {
        tracing::info!(?event, "engine event");
    }
}

/// Sink collecting events in memory, used by tests and embedders that
/// want to drain events in-process instead of over a transport.
#[derive(Default)]
pub struct MemoryEventSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }
}

#[async_trait::async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}
