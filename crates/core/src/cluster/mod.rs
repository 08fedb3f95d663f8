//! Node registry and cluster membership.

pub mod manager;
pub mod node;

pub use manager::{ClusterManager, ClusterStats};
pub use node::{GenerationRequest, Node, NodeClient, NodeStatus, ScopedClient, StreamingGeneration};
