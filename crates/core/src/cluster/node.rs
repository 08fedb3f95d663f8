//! Node identity and the inference-node contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Liveness status of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// A registered inference node. Identity (`host:port`) is unique in the
/// cluster; latency is re-measured by every health probe and never trusted
/// across a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub status: NodeStatus,
    pub models: Vec<String>,
    /// Milliseconds; `None` means unknown and sorts as +infinity during
    /// selection.
    pub latency_ms: Option<u64>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl Node {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn advertises(&self, model_substring: &str) -> bool {
        self.models.iter().any(|m| m.contains(model_substring))
    }

    pub fn is_eligible_for(&self, model: Option<&str>) -> bool {
        if self.status != NodeStatus::Online {
            return false;
        }
        match model {
            None | Some("default") => true,
            Some(m) => self.advertises(m),
        }
    }
}

/// Outbound contract for one inference node: implemented once per
/// concrete wire protocol, which is explicitly out of scope for this
/// crate — callers plug in their own `NodeClient`.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn list_models(&self) -> anyhow::Result<Vec<String>>;
    async fn web_search(&self, query: &str, max: usize) -> anyhow::Result<Vec<String>>;

    /// Round-trip time of the last successful probe, if the implementation
    /// chooses to report one.
    async fn probe_latency(&self) -> Option<Duration> {
        None
    }
}

/// Per-turn streaming generation surface, exposed only through a
/// [`ScopedClient`] — never through the shared [`NodeClient`] handle, so
/// two concurrent turns can never interleave tokens on the same node.
#[async_trait]
pub trait StreamingGeneration: Send + Sync {
    /// Stream tokens for one turn. `on_token` is invoked for every token;
    /// returning `Err(GatewayError::Aborted)` from `on_token` stops
    /// generation immediately.
    async fn generate(
        &self,
        prompt: &GenerationRequest,
        on_token: &mut (dyn FnMut(&str) -> Result<(), GatewayError> + Send),
    ) -> Result<String, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message: String,
    pub history: Vec<crate::storage::StoredMessage>,
    pub images: Vec<Vec<u8>>,
    pub doc_id: Option<String>,
    pub web_search_context: Option<String>,
    pub mode: crate::pipeline::chat::ModeFlags,
    pub enabled_tools: Vec<String>,
}

/// Short-lived handle bound to one node and one model for the duration of
/// one request. Owned exclusively by the turn that
/// created it; this is the central concurrency invariant of the cluster
/// layer (P2: no scoped client is ever observed by two concurrent turns).
pub struct ScopedClient {
    pub node_id: String,
    pub model: String,
    client: std::sync::Arc<dyn NodeClient>,
    generator: std::sync::Arc<dyn StreamingGeneration>,
}

impl ScopedClient {
    pub fn new(
        node_id: String,
        model: String,
        client: std::sync::Arc<dyn NodeClient>,
        generator: std::sync::Arc<dyn StreamingGeneration>,
    ) -> Self {
        Self {
            node_id,
            model,
            client,
            generator,
        }
    }

    pub async fn web_search(&self, query: &str, max: usize) -> anyhow::Result<Vec<String>> {
        self.client.web_search(query, max).await
    }

    pub async fn generate(
        &self,
        prompt: &GenerationRequest,
        on_token: &mut (dyn FnMut(&str) -> Result<(), GatewayError> + Send),
    ) -> Result<String, GatewayError> {
        self.generator.generate(prompt, on_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(status: NodeStatus, models: &[&str]) -> Node {
        Node {
            host: "10.0.0.1".into(),
            port: 8080,
            name: "n1".into(),
            status,
            models: models.iter().map(|s| s.to_string()).collect(),
            latency_ms: None,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn id_is_host_colon_port() {
        assert_eq!(node(NodeStatus::Online, &[]).id(), "10.0.0.1:8080");
    }

    #[test]
    fn offline_node_is_never_eligible() {
        let n = node(NodeStatus::Offline, &["llama-70b"]);
        assert!(!n.is_eligible_for(Some("llama")));
        assert!(!n.is_eligible_for(None));
    }

    #[test]
    fn default_sentinel_bypasses_model_filter() {
        let n = node(NodeStatus::Online, &[]);
        assert!(n.is_eligible_for(Some("default")));
        assert!(n.is_eligible_for(None));
    }

    #[test]
    fn model_match_is_substring_not_equality() {
        let n = node(NodeStatus::Online, &["llama-70b-instruct-q4"]);
        assert!(n.is_eligible_for(Some("llama-70b")));
        assert!(!n.is_eligible_for(Some("llama-405b")));
    }
}
