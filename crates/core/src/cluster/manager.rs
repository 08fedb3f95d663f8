//! Node registry, health probing and best-node selection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::node::{Node, NodeClient, NodeStatus, ScopedClient, StreamingGeneration};
use crate::events::{ClusterEvent, ClusterEventBus};

/// Aggregate cluster stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterStats {
    pub total: usize,
    pub online: usize,
    pub models: Vec<String>,
    pub latencies_ms: HashMap<String, Option<u64>>,
}

struct Registered {
    node: Node,
    client: Arc<dyn NodeClient>,
    generator: Arc<dyn StreamingGeneration>,
}

/// Maintains the live registry of inference nodes and selects one per
/// request.
pub struct ClusterManager {
    nodes: RwLock<HashMap<String, Registered>>,
    events: ClusterEventBus,
    heartbeat_interval: Duration,
    health_loop: RwLock<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    pub fn new(events: ClusterEventBus, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            events,
            heartbeat_interval,
            health_loop: RwLock::new(None),
        })
    }

    pub fn events(&self) -> &ClusterEventBus {
        &self.events
    }

    /// Register configured nodes and begin the health-check loop.
    pub async fn start(
        self: &Arc<Self>,
        initial: Vec<(String, u16, Option<String>, Arc<dyn NodeClient>, Arc<dyn StreamingGeneration>)>,
    ) {
        for (host, port, name, client, generator) in initial {
            self.add_node(host, port, name, client, generator).await;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.heartbeat_interval);
            loop {
                interval.tick().await;
                this.health_check_tick().await;
            }
        });
        *self.health_loop.write().await = Some(handle);
    }

    /// Cancel the health-check loop and clear the registry.
    pub async fn stop(&self) {
        if let Some(handle) = self.health_loop.write().await.take() {
            handle.abort();
        }
        self.nodes.write().await.clear();
    }

    /// Idempotent on `(host, port)`. `None` means the node was already
    /// present. Status is `online` iff the initial probe succeeds; a failed
    /// probe still registers the node as `offline` with empty models.
    pub async fn add_node(
        &self,
        host: String,
        port: u16,
        name: Option<String>,
        client: Arc<dyn NodeClient>,
        generator: Arc<dyn StreamingGeneration>,
    ) -> Option<Node> {
        let id = format!("{host}:{port}");
        {
            let nodes = self.nodes.read().await;
            if nodes.contains_key(&id) {
                return None;
            }
        }

        let (status, models, latency_ms) = probe(client.as_ref()).await;
        let node = Node {
            host,
            port,
            name: name.unwrap_or_else(|| id.clone()),
            status,
            models,
            latency_ms,
            last_seen: Utc::now(),
        };

        let mut nodes = self.nodes.write().await;
        // Re-check under the write lock: two concurrent AddNode calls for
        // the same id must not both insert.
        if nodes.contains_key(&id) {
            return None;
        }
        let result = node.clone();
        nodes.insert(
            id,
            Registered {
                node,
                client,
                generator,
            },
        );
        Some(result)
    }

    pub async fn remove_node(&self, id: &str) -> bool {
        self.nodes.write().await.remove(id).is_some()
    }

    pub async fn get_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().map(|r| r.node.clone()).collect()
    }

    pub async fn get_online_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .map(|r| &r.node)
            .filter(|n| n.status == NodeStatus::Online)
            .cloned()
            .collect()
    }

    pub async fn get_nodes_with_model(&self, model: &str) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .map(|r| &r.node)
            .filter(|n| n.is_eligible_for(Some(model)))
            .cloned()
            .collect()
    }

    /// Shared, long-lived handle. Callers must not mutate the bound model on
    /// it — this is a documented hazard; turns that need an
    /// exclusive handle must call [`Self::create_scoped_client`] instead.
    pub async fn get_client(&self, id: &str) -> Option<Arc<dyn NodeClient>> {
        self.nodes.read().await.get(id).map(|r| Arc::clone(&r.client))
    }

    /// Fresh handle bound to `model` for exactly one turn.
    pub async fn create_scoped_client(&self, node_id: &str, model: Option<&str>) -> Option<ScopedClient> {
        let nodes = self.nodes.read().await;
        let registered = nodes.get(node_id)?;
        let resolved_model = model
            .filter(|m| *m != "default")
            .map(|m| m.to_string())
            .or_else(|| registered.node.models.first().cloned())
            .unwrap_or_else(|| "default".to_string());

        Some(ScopedClient::new(
            node_id.to_string(),
            resolved_model,
            Arc::clone(&registered.client),
            Arc::clone(&registered.generator),
        ))
    }

    /// Selection rules: online nodes, filtered by
    /// model substring match when `model` is given and isn't the
    /// `"default"` sentinel; smallest latency wins; unknown latency sorts
    /// as +infinity. A tie between two nodes at the same latency is broken
    /// by `nodes`' iteration order, which is incidental (the registry is a
    /// `HashMap`) rather than insertion order — callers should not depend
    /// on which of two equally-latent nodes wins a tie.
    pub async fn get_best_node(&self, model: Option<&str>) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .map(|r| &r.node)
            .filter(|n| n.is_eligible_for(model))
            .min_by(|a, b| {
                let la = a.latency_ms.unwrap_or(u64::MAX);
                let lb = b.latency_ms.unwrap_or(u64::MAX);
                la.cmp(&lb)
            })
            .cloned()
    }

    pub async fn get_stats(&self) -> ClusterStats {
        let nodes = self.nodes.read().await;
        let mut models = HashSet::new();
        let mut latencies_ms = HashMap::new();
        let mut online = 0;
        for registered in nodes.values() {
            if registered.node.status == NodeStatus::Online {
                online += 1;
            }
            for model in &registered.node.models {
                models.insert(model.clone());
            }
            latencies_ms.insert(registered.node.id(), registered.node.latency_ms);
        }
        ClusterStats {
            total: nodes.len(),
            online,
            models: models.into_iter().collect(),
            latencies_ms,
        }
    }

    /// Probe every registered node in parallel; update status/models/
    /// latency and emit one event per transition. Probe errors set `offline` without removing the node.
    async fn health_check_tick(&self) {
        let snapshot: Vec<(String, Arc<dyn NodeClient>)> = {
            let nodes = self.nodes.read().await;
            nodes.iter().map(|(id, r)| (id.clone(), Arc::clone(&r.client))).collect()
        };

        let probes = snapshot
            .into_iter()
            .map(|(id, client)| async move { (id, probe(client.as_ref()).await) });
        let results = futures::future::join_all(probes).await;

        let mut nodes = self.nodes.write().await;
        for (id, (status, models, latency_ms)) in results {
            let Some(registered) = nodes.get_mut(&id) else {
                continue;
            };
            let was_online = registered.node.status == NodeStatus::Online;
            let fields_changed = registered.node.models != models || registered.node.latency_ms != latency_ms;

            registered.node.status = status;
            registered.node.models = models;
            registered.node.latency_ms = latency_ms;
            registered.node.last_seen = Utc::now();

            match (was_online, status == NodeStatus::Online) {
                (false, true) => self.events.publish(ClusterEvent::NodeOnline { node_id: id }),
                (true, false) => self.events.publish(ClusterEvent::NodeOffline { node_id: id }),
                (true, true) if fields_changed => {
                    self.events.publish(ClusterEvent::NodeUpdated { node_id: id })
                }
                _ => {}
            }
        }
    }
}

async fn probe(client: &dyn NodeClient) -> (NodeStatus, Vec<String>, Option<u64>) {
    if !client.is_available().await {
        return (NodeStatus::Offline, Vec::new(), None);
    }

    let models = client.list_models().await.unwrap_or_default();
    let latency_ms = client.probe_latency().await.map(|d| d.as_millis() as u64);
    (NodeStatus::Online, models, latency_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeClient {
        available: AtomicBool,
        models: Vec<String>,
    }

    #[async_trait]
    impl NodeClient for FakeClient {
        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
        async fn list_models(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.models.clone())
        }
        async fn web_search(&self, _query: &str, _max: usize) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct FakeGenerator;
    #[async_trait]
    impl StreamingGeneration for FakeGenerator {
        async fn generate(
            &self,
            _prompt: &super::super::node::GenerationRequest,
            _on_token: &mut (dyn FnMut(&str) -> Result<(), crate::error::GatewayError> + Send),
        ) -> Result<String, crate::error::GatewayError> {
            Ok("ok".into())
        }
    }

    fn fake(available: bool, models: &[&str]) -> (Arc<dyn NodeClient>, Arc<dyn StreamingGeneration>) {
        (
            Arc::new(FakeClient {
                available: AtomicBool::new(available),
                models: models.iter().map(|s| s.to_string()).collect(),
            }),
            Arc::new(FakeGenerator),
        )
    }

    #[tokio::test]
    async fn add_node_is_idempotent() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (client, gen) = fake(true, &["a"]);
        let first = manager
            .add_node("h".into(), 1, None, client.clone(), gen.clone())
            .await;
        assert!(first.is_some());
        let second = manager.add_node("h".into(), 1, None, client, gen).await;
        assert!(second.is_none());
        assert_eq!(manager.get_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn add_node_registers_offline_on_failed_probe() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (client, gen) = fake(false, &[]);
        let node = manager.add_node("h".into(), 1, None, client, gen).await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.models.is_empty());
    }

    #[tokio::test]
    async fn get_best_node_prefers_lowest_latency() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (c1, g1) = fake(true, &["llama"]);
        let (c2, g2) = fake(true, &["llama"]);
        manager.add_node("slow".into(), 1, None, c1, g1).await;
        manager.add_node("fast".into(), 2, None, c2, g2).await;

        // Manually set latencies post-registration to simulate a health tick.
        {
            let mut nodes = manager.nodes.write().await;
            nodes.get_mut("slow:1").unwrap().node.latency_ms = Some(500);
            nodes.get_mut("fast:2").unwrap().node.latency_ms = Some(10);
        }

        let best = manager.get_best_node(Some("llama")).await.unwrap();
        assert_eq!(best.id(), "fast:2");
    }

    #[tokio::test]
    async fn get_best_node_filters_by_model_substring() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (c1, g1) = fake(true, &["llama-70b-instruct"]);
        manager.add_node("h".into(), 1, None, c1, g1).await;

        assert!(manager.get_best_node(Some("llama-70b")).await.is_some());
        assert!(manager.get_best_node(Some("gpt-4")).await.is_none());
        assert!(manager.get_best_node(Some("default")).await.is_some());
        assert!(manager.get_best_node(None).await.is_some());
    }

    #[tokio::test]
    async fn create_scoped_client_is_independent_per_call() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (client, gen) = fake(true, &["llama"]);
        manager.add_node("h".into(), 1, None, client, gen).await;

        let a = manager.create_scoped_client("h:1", Some("llama")).await.unwrap();
        let b = manager.create_scoped_client("h:1", Some("llama")).await.unwrap();
        assert_eq!(a.model, "llama");
        assert_eq!(b.model, "llama");
    }

    #[tokio::test]
    async fn remove_node_clears_registry_entry() {
        let manager = ClusterManager::new(ClusterEventBus::new(), Duration::from_secs(30));
        let (client, gen) = fake(true, &[]);
        manager.add_node("h".into(), 1, None, client, gen).await;
        assert!(manager.remove_node("h:1").await);
        assert!(manager.get_nodes().await.is_empty());
        assert!(!manager.remove_node("h:1").await);
    }
}
