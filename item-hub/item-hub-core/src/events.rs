//! Broadcast event bus and the operation-feedback contract.
//!
//! Collaborators (indexers, notifiers, audit sinks) subscribe at startup and
//! observe mutations as typed events instead of registering ambient global
//! hooks. Bulk operations additionally report one `OperationFeedback` per
//! root item through the `NotificationSink` seam.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::HubError;
use crate::path::ItemPath;

/// The structural operations a bulk request can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Move,
    Copy,
    Delete,
    Restore,
    Purge,
}

/// Terminal result for one root item of a bulk operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded {
        #[serde(skip_serializing_if = "Option::is_none")]
        new_path: Option<ItemPath>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_id: Option<Uuid>,
    },
    Failed {
        reason: HubError,
    },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded { .. })
    }
}

/// Delivered exactly once per root item named in a bulk request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationFeedback {
    pub op: OpKind,
    pub item_id: Uuid,
    pub outcome: ItemOutcome,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    Created { id: Uuid },
    Updated { id: Uuid },
    Renamed { id: Uuid },
    Moved { id: Uuid, new_parent: Uuid },
    Copied { id: Uuid, new_id: Uuid },
    Deleted { id: Uuid },
    Restored { id: Uuid },
    Purged { id: Uuid },
    Shared { id: Uuid, actor: String },
    Unshared { id: Uuid, actor: String },
    Operation(OperationFeedback),
}

impl Event {
    /// The item the event is about, for permission-filtered streaming.
    pub fn item_id(&self) -> Uuid {
        match self {
            Event::Created { id }
            | Event::Updated { id }
            | Event::Renamed { id }
            | Event::Moved { id, .. }
            | Event::Copied { id, .. }
            | Event::Deleted { id }
            | Event::Restored { id }
            | Event::Purged { id }
            | Event::Shared { id, .. }
            | Event::Unshared { id, .. } => *id,
            Event::Operation(feedback) => feedback.item_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer of per-item bulk outcomes. The hub only defines the contract;
/// delivery targets (webhooks, mail, queues) live with the collaborators.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, feedback: OperationFeedback);
}

/// Default sink: forwards outcomes onto the event bus.
pub struct BusSink {
    bus: EventBus,
}

impl BusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl NotificationSink for BusSink {
    async fn notify(&self, feedback: OperationFeedback) {
        self.bus.send(Event::Operation(feedback));
    }
}

/// In-memory sink for tests and embedders that poll instead of subscribe.
#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<OperationFeedback>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<OperationFeedback> {
        self.entries.lock().clone()
    }

    pub fn take(&self) -> Vec<OperationFeedback> {
        std::mem::take(&mut *self.entries.lock())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, feedback: OperationFeedback) {
        self.entries.lock().push(feedback);
    }
}
