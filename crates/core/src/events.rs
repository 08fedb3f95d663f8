//! Cluster event broadcast.
//!
//! Cluster events propagate to sessions via a broadcast channel owned by
//! this module, not a back-pointer from nodes to sessions: one-way
//! subscription with copy-on-send, scaled down to the one event kind this
//! plane needs to fan out.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CLUSTER_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    NodeOnline { node_id: String },
    NodeOffline { node_id: String },
    NodeUpdated { node_id: String },
}

/// Broadcast hub for cluster membership changes. `SessionHandler` holds its
/// own receiver per connection; the cluster manager never knows how many
/// subscribers exist or who they are.
#[derive(Clone)]
pub struct ClusterEventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl Default for ClusterEventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CLUSTER_EVENT_BUFFER);
        Self { sender }
    }
}

impl ClusterEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ClusterEvent) {
        // No subscribers is a normal state (e.g. no sessions yet); the send
        // error is not a failure worth logging.
        let _ = self.sender.send(event);
    }
}
