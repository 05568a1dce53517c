use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{NodeId, VersionId};

use super::traits::IndexSink;

/// Committed change, published after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    Created { path: String, node_id: NodeId },
    Modified { path: String, node_id: NodeId },
    Deleted { path: String },
    Renamed { from: String, to: String },
    Snapshotted { store: String, version: VersionId },
    StoreCreated { store: String },
    StorePurged { store: String },
    StoreRenamed { from: String, to: String },
}

impl IndexEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IndexEvent::Created { .. } => "created",
            IndexEvent::Modified { .. } => "modified",
            IndexEvent::Deleted { .. } => "deleted",
            IndexEvent::Renamed { .. } => "renamed",
            IndexEvent::Snapshotted { .. } => "snapshotted",
            IndexEvent::StoreCreated { .. } => "store_created",
            IndexEvent::StorePurged { .. } => "store_purged",
            IndexEvent::StoreRenamed { .. } => "store_renamed",
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone)]
pub struct NullIndexSink;

impl IndexSink for NullIndexSink {
    fn notify(&self, _event: IndexEvent) {}
}

/// Forwards events into an unbounded channel drained by an indexer task.
#[derive(Debug, Clone)]
pub struct ChannelIndexSink {
    sender: mpsc::UnboundedSender<IndexEvent>,
}

impl ChannelIndexSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IndexEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl IndexSink for ChannelIndexSink {
    fn notify(&self, event: IndexEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::debug!(event = e.0.name(), "Index receiver dropped, event discarded");
        }
    }
}
