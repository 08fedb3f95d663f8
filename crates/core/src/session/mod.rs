//! Duplex connection state and the session handler.

pub mod handler;
pub mod types;

pub use handler::SessionHandler;
pub use types::{AgentInfo, ConnectedSession, InboundMessage, McpSettings, OutboundMessage};
