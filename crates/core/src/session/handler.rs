//! Duplex message loop: auth, framing, heartbeat, dispatch, abort, broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::auth::{Principal, TokenVerifier, extract_bearer_token};
use crate::cluster::ClusterManager;
use crate::events::ClusterEventBus;
use crate::pipeline::{CancellationHandle, ChatCallbacks, ChatPipeline, ChatRequest};
use crate::tools::{ToolRegistry, UserContext};

use super::types::{AgentInfo, ConnectedSession, InboundMessage, MAX_FRAME_BYTES, OutboundMessage};

use chatgate_sandbox::SandboxRegistry;

struct FrameCallbacks<'a> {
    sender: &'a mpsc::Sender<Message>,
    message_id: String,
}

impl ChatCallbacks for FrameCallbacks<'_> {
    fn on_session_created(&mut self, session_id: &str) {
        send(self.sender, &OutboundMessage::SessionCreated {
            session_id: session_id.to_string(),
        });
    }

    fn on_agent_selected(&mut self, node_id: &str, model: &str) {
        send(self.sender, &OutboundMessage::AgentSelected {
            node_id: node_id.to_string(),
            model: model.to_string(),
        });
    }

    fn on_token(&mut self, token: &str) {
        send(self.sender, &OutboundMessage::Token {
            message_id: self.message_id.clone(),
            token: token.to_string(),
        });
    }
}

fn send(sender: &mpsc::Sender<Message>, message: &OutboundMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if sender.try_send(Message::Text(json.into())).is_err() {
                tracing::debug!("dropped outbound frame: channel closed or full");
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to serialize outbound frame"),
    }
}

/// Terminates duplex client connections.
pub struct SessionHandler {
    sessions: Mutex<HashMap<String, Arc<ConnectedSession>>>,
    cluster: Arc<ClusterManager>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<ChatPipeline>,
    token_verifier: Arc<dyn TokenVerifier>,
    sandboxes: Arc<SandboxRegistry>,
    events: ClusterEventBus,
}

impl SessionHandler {
    pub fn new(
        cluster: Arc<ClusterManager>,
        tools: Arc<ToolRegistry>,
        pipeline: Arc<ChatPipeline>,
        token_verifier: Arc<dyn TokenVerifier>,
        sandboxes: Arc<SandboxRegistry>,
        events: ClusterEventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            cluster,
            tools,
            pipeline,
            token_verifier,
            sandboxes,
            events,
        })
    }

    /// Drive one accepted websocket to completion.
    pub async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        cookie_header: Option<String>,
        authorization_header: Option<String>,
    ) {
        let conn_id = Uuid::new_v4().to_string();
        let principal = match extract_bearer_token(cookie_header.as_deref(), authorization_header.as_deref()) {
            Some(token) => match self.token_verifier.verify(&token).await {
                Some(principal) => principal,
                None => Principal::guest(),
            },
            None => Principal::guest(),
        };

        let (sender, mut receiver) = mpsc::channel::<Message>(64);
        let session = Arc::new(ConnectedSession::new(principal, conn_id.clone(), sender.clone()));
        self.sessions.lock().await.insert(conn_id.clone(), Arc::clone(&session));

        let stats = self.cluster.get_stats().await;
        let nodes = self.cluster.get_nodes().await;
        send(&sender, &OutboundMessage::Init {
            name: "chatgate".into(),
            stats: stats.clone(),
            nodes,
        });
        send(&sender, &OutboundMessage::Stats { stats });

        let (mut ws_sender, mut ws_receiver) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        let cluster_forward = {
            let sender = sender.clone();
            let mut rx = self.events.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    send(&sender, &OutboundMessage::ClusterEvent { event });
                }
            })
        };

        let this = Arc::clone(&self);
        let session_for_receive = Arc::clone(&session);
        let conn_id_for_receive = conn_id.clone();
        let receive_task = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if text.len() > MAX_FRAME_BYTES {
                            send(&session_for_receive.sender, &OutboundMessage::error("메시지가 너무 큽니다"));
                            continue;
                        }
                        this.dispatch(&session_for_receive, &text).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Pong(_)) => {
                        session_for_receive.alive.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, conn_id = conn_id_for_receive, "websocket receive error");
                        break;
                    }
                }
            }
        });

        session.register_tasks(vec![
            send_task.abort_handle(),
            receive_task.abort_handle(),
            cluster_forward.abort_handle(),
        ]);

        tokio::select! {
            _ = send_task => {},
            _ = receive_task => {},
        }

        cluster_forward.abort();
        session.cancel_active();
        self.sessions.lock().await.remove(&conn_id);
    }

    /// Parse and route one inbound frame.
    async fn dispatch(&self, session: &Arc<ConnectedSession>, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                send(&session.sender, &OutboundMessage::error("잘못된 메시지 형식입니다"));
                return;
            }
        };
        if !value.is_object() || value.get("type").and_then(|t| t.as_str()).is_none() {
            send(&session.sender, &OutboundMessage::error("잘못된 메시지 형식입니다"));
            return;
        }

        let message: InboundMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            // An object with a recognized shape but unknown `type` value is
            // silently ignored; serde's untagged-variant failure also covers a
            // known type whose fields don't match, which we treat the same.
            Err(_) => return,
        };

        match message {
            InboundMessage::Refresh => {
                let stats = self.cluster.get_stats().await;
                let nodes = self.cluster.get_nodes().await;
                let mcp_settings = session.mcp_settings.lock().unwrap().clone();
                send(&session.sender, &OutboundMessage::Update { stats, nodes, mcp_settings });
            }
            InboundMessage::McpSettings { settings } => {
                *session.mcp_settings.lock().unwrap() = settings;
                send(&session.sender, &OutboundMessage::McpSettingsAck);
            }
            InboundMessage::RequestAgents => {
                let agents = self
                    .tools
                    .list_all()
                    .into_iter()
                    .map(|def| {
                        if let Some((server, original)) = def.name.split_once(crate::tools::NAMESPACE_SEPARATOR) {
                            AgentInfo {
                                url: format!("mcp://{server}/{original}"),
                                name: def.name.clone(),
                                description: def.description.clone(),
                                external: true,
                            }
                        } else {
                            AgentInfo {
                                url: format!("local://{}", def.name),
                                name: def.name.clone(),
                                description: def.description.clone(),
                                external: false,
                            }
                        }
                    })
                    .collect();
                send(&session.sender, &OutboundMessage::Agents { agents });
            }
            InboundMessage::Abort => {
                session.cancel_active();
                send(&session.sender, &OutboundMessage::Aborted);
            }
            InboundMessage::Pong => {
                session.alive.store(true, Ordering::SeqCst);
            }
            InboundMessage::Chat {
                message,
                session_id,
                model,
                node_id,
                doc_id,
                web_search_context,
                mode,
                enabled_tools,
            } => {
                self.handle_chat(
                    session,
                    ChatRequest {
                        message,
                        session_id,
                        model,
                        node_id,
                        images: Vec::new(),
                        doc_id,
                        web_search_context,
                        mode,
                        enabled_tools,
                    },
                )
                .await;
            }
        }
    }

    async fn handle_chat(&self, session: &Arc<ConnectedSession>, request: ChatRequest) {
        let cancellation = CancellationHandle::new();
        session.set_active(cancellation.clone());

        let principal = &session.principal;
        let principal_key = principal.principal_key(Some(&session.anon_session_id)).to_string();
        let sandbox_principal = principal.user_id.clone().unwrap_or_else(|| session.anon_session_id.clone());
        let context = UserContext {
            principal_id: sandbox_principal.clone(),
            role: principal.role,
            tier: principal.tier,
            sandbox: Arc::new(self.sandboxes.for_principal(&sandbox_principal)),
        };

        let message_id = Uuid::new_v4().to_string();
        let mut callbacks = FrameCallbacks {
            sender: &session.sender,
            message_id: message_id.clone(),
        };

        let result = self
            .pipeline
            .process_chat(
                request,
                &principal_key,
                principal.user_id.as_deref(),
                &context,
                &cancellation,
                &mut callbacks,
            )
            .await;

        session.clear_active();

        match result {
            Ok(_response) => {
                send(&session.sender, &OutboundMessage::Done { message_id });
            }
            Err(crate::error::GatewayError::Aborted) => {
                send(&session.sender, &OutboundMessage::Aborted);
            }
            Err(err) => {
                send(&session.sender, &OutboundMessage::from_gateway_error(err));
            }
        }
    }

    /// Every [`super::types::HEARTBEAT_INTERVAL_SECS`], fire cancellation and
    /// drop any session whose liveness flag is false; otherwise clear the
    /// flag and ping it.
    pub async fn heartbeat_tick(&self) {
        let victims: Vec<(String, Arc<ConnectedSession>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, session)| !session.alive.load(Ordering::SeqCst))
                .map(|(id, session)| (id.clone(), Arc::clone(session)))
                .collect()
        };

        for (id, session) in &victims {
            session.cancel_active();
            session.terminate_transport();
            self.sessions.lock().await.remove(id);
        }

        let survivors: Vec<Arc<ConnectedSession>> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|session| session.alive.load(Ordering::SeqCst))
                .cloned()
                .collect()
        };
        for session in survivors {
            session.alive.store(false, Ordering::SeqCst);
            if session.sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                tracing::debug!("failed to send heartbeat ping: channel closed");
            }
        }
    }

    /// Sends a frame to every open session.
    pub async fn broadcast(&self, message: &OutboundMessage) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            send(&session.sender, message);
        }
    }

    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                super::types::HEARTBEAT_INTERVAL_SECS,
            ));
            loop {
                interval.tick().await;
                this.heartbeat_tick().await;
            }
        })
    }

    #[cfg(test)]
    async fn insert_session_for_test(&self, conn_id: String, session: Arc<ConnectedSession>) {
        self.sessions.lock().await.insert(conn_id, session);
    }

    #[cfg(test)]
    async fn session_count_for_test(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::events::ClusterEventBus;
    use crate::rate_limit::{RateLimitStore, RateLimiter};
    use crate::storage::{ConversationStore, MessageRole, StorageError, StoredMessage};
    use chrono::{DateTime, Utc};

    struct NullRateLimitStore;

    #[async_trait::async_trait]
    impl RateLimitStore for NullRateLimitStore {
        async fn upsert(&self, _key: &str, _entry: crate::rate_limit::RateLimitEntry) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> anyhow::Result<Option<crate::rate_limit::RateLimitEntry>> {
            Ok(None)
        }
        async fn sweep_expired(&self, _now: DateTime<Utc>) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    struct NullConversationStore;

    #[async_trait::async_trait]
    impl ConversationStore for NullConversationStore {
        async fn create_session(
            &self,
            _user_id: Option<&str>,
            _title: &str,
            _parent_session_id: Option<&str>,
            _anon_session_id: Option<&str>,
        ) -> Result<String, StorageError> {
            Ok("s1".into())
        }
        async fn add_message(
            &self,
            _session_id: &str,
            _role: MessageRole,
            _content: &str,
            _meta: Option<serde_json::Value>,
        ) -> Result<(), StorageError> {
            Ok(())
        }
        async fn history(&self, _session_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
            Ok(Vec::new())
        }
    }

    struct GuestVerifier;

    #[async_trait::async_trait]
    impl TokenVerifier for GuestVerifier {
        async fn verify(&self, _token: &str) -> Option<Principal> {
            None
        }
    }

    fn test_handler() -> Arc<SessionHandler> {
        let events = ClusterEventBus::new();
        let cluster = ClusterManager::new(events.clone(), std::time::Duration::from_secs(30));
        let tools = Arc::new(ToolRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::new(Arc::new(NullRateLimitStore)));
        let pipeline = Arc::new(ChatPipeline::new(
            rate_limiter,
            Arc::clone(&cluster),
            Arc::clone(&tools),
            Arc::new(NullConversationStore),
        ));
        let sandboxes = Arc::new(SandboxRegistry::new(std::env::temp_dir()));
        SessionHandler::new(cluster, tools, pipeline, Arc::new(GuestVerifier), sandboxes, events)
    }

    fn test_session() -> (Arc<ConnectedSession>, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(8);
        let session = Arc::new(ConnectedSession::new(Principal::guest(), "anon-1".into(), sender));
        (session, receiver)
    }

    #[tokio::test]
    async fn heartbeat_tick_drops_dead_session_and_terminates_its_tasks() {
        let handler = test_handler();
        let (session, _receiver) = test_session();

        let dead_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let dead_flag_clone = Arc::clone(&dead_flag);
        let never_finishes = tokio::spawn(async move {
            // Parked until aborted; flips `dead_flag` only if it somehow runs to completion.
            futures_util::future::pending::<()>().await;
            dead_flag_clone.store(true, Ordering::SeqCst);
        });
        session.register_tasks(vec![never_finishes.abort_handle()]);

        session.alive.store(false, Ordering::SeqCst);
        handler.insert_session_for_test("dead".into(), Arc::clone(&session)).await;

        handler.heartbeat_tick().await;

        assert_eq!(handler.session_count_for_test().await, 0);
        assert!(never_finishes.await.unwrap_err().is_cancelled());
        assert!(!dead_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn heartbeat_tick_pings_survivors_and_resets_their_liveness_flag() {
        let handler = test_handler();
        let (session, mut receiver) = test_session();
        session.alive.store(true, Ordering::SeqCst);
        handler.insert_session_for_test("alive".into(), Arc::clone(&session)).await;

        handler.heartbeat_tick().await;

        assert_eq!(handler.session_count_for_test().await, 1);
        assert!(!session.alive.load(Ordering::SeqCst));
        assert!(matches!(receiver.recv().await, Some(Message::Ping(_))));
    }

    #[tokio::test]
    async fn refresh_reports_the_last_applied_mcp_settings() {
        let handler = test_handler();
        let (session, mut receiver) = test_session();
        *session.mcp_settings.lock().unwrap() = super::super::types::McpSettings {
            sequential_thinking: true,
            web_search: false,
        };

        handler.dispatch(&session, r#"{"type":"refresh"}"#).await;

        let frame = receiver.recv().await.expect("update frame");
        let Message::Text(text) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["mcp_settings"]["sequential_thinking"], true);
        assert_eq!(value["mcp_settings"]["web_search"], false);
    }
}
