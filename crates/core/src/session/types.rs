//! Duplex frame shapes and per-connection state.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::pipeline::{CancellationHandle, ModeFlags};

/// Frames larger than this are rejected.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Heartbeat tick.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Closed set of inbound frame types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Refresh,
    McpSettings {
        #[serde(rename = "mcp_settings")]
        settings: McpSettings,
    },
    RequestAgents,
    Chat {
        message: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        doc_id: Option<String>,
        #[serde(default)]
        web_search_context: Option<String>,
        #[serde(default)]
        mode: ModeFlags,
        #[serde(default)]
        enabled_tools: Vec<String>,
    },
    Abort,
    /// A `pong` reply to our heartbeat `ping`.
    Pong,
}

/// Closed record for the `mcp_settings` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpSettings {
    #[serde(default)]
    pub sequential_thinking: bool,
    #[serde(default)]
    pub web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub url: String,
    pub name: String,
    pub description: String,
    pub external: bool,
}

/// Closed set of outbound frame types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Init {
        name: String,
        stats: crate::cluster::ClusterStats,
        nodes: Vec<crate::cluster::Node>,
    },
    Stats {
        stats: crate::cluster::ClusterStats,
    },
    Update {
        stats: crate::cluster::ClusterStats,
        nodes: Vec<crate::cluster::Node>,
        mcp_settings: McpSettings,
    },
    McpSettingsAck,
    Agents {
        agents: Vec<AgentInfo>,
    },
    SessionCreated {
        session_id: String,
    },
    AgentSelected {
        node_id: String,
        model: String,
    },
    Token {
        message_id: String,
        token: String,
    },
    Done {
        message_id: String,
    },
    Aborted,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    ClusterEvent {
        event: crate::events::ClusterEvent,
    },
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
            error_type: None,
            retry_after: None,
        }
    }

    pub fn from_gateway_error(err: crate::error::GatewayError) -> Self {
        let frame = err.into_client_frame();
        OutboundMessage::Error {
            message: frame.message,
            error_type: Some(frame.error_type),
            retry_after: frame.retry_after,
        }
    }
}

/// One live duplex connection. Owned exclusively by
/// [`super::handler::SessionHandler`]'s registry.
pub struct ConnectedSession {
    pub principal: Principal,
    pub anon_session_id: String,
    pub sender: tokio::sync::mpsc::Sender<Message>,
    pub active_cancellation: std::sync::Mutex<Option<CancellationHandle>>,
    pub alive: std::sync::atomic::AtomicBool,
    pub mcp_settings: std::sync::Mutex<McpSettings>,
    /// Abort handles for the tasks `handle_socket` spawned for this
    /// connection (send loop, receive loop, cluster event forwarder).
    /// Aborting all of them tears down the transport even when no one is
    /// awaiting the socket's own `select!` anymore — e.g. a heartbeat
    /// sweep that drops a session the registry already gave up on.
    tasks: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
}

impl ConnectedSession {
    pub fn new(principal: Principal, anon_session_id: String, sender: tokio::sync::mpsc::Sender<Message>) -> Self {
        Self {
            principal,
            anon_session_id,
            sender,
            active_cancellation: std::sync::Mutex::new(None),
            alive: std::sync::atomic::AtomicBool::new(true),
            mcp_settings: std::sync::Mutex::new(McpSettings::default()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Fires any in-flight turn's cancellation handle exactly once.
    pub fn cancel_active(&self) {
        if let Some(handle) = self.active_cancellation.lock().unwrap().take() {
            handle.cancel();
        }
    }

    pub fn set_active(&self, handle: CancellationHandle) {
        *self.active_cancellation.lock().unwrap() = Some(handle);
    }

    pub fn clear_active(&self) {
        self.active_cancellation.lock().unwrap().take();
    }

    pub fn register_tasks(&self, handles: Vec<tokio::task::AbortHandle>) {
        *self.tasks.lock().unwrap() = handles;
    }

    /// Aborts every task driving this connection's socket, closing the
    /// underlying transport. Used when the registry kills a session whose
    /// liveness flag was never refreshed.
    pub fn terminate_transport(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
