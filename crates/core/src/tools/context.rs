//! Tool execution context and the unified tool contract.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolved identity passed to every built-in tool invocation.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub principal_id: String,
    pub role: crate::rate_limit::Role,
    pub tier: crate::rate_limit::Tier,
    pub sandbox: Arc<chatgate_sandbox::Sandbox>,
}

impl UserContext {
    pub fn resolve_path(&self, candidate: &str) -> Option<std::path::PathBuf> {
        self.sandbox.resolve_path(candidate)
    }

    pub fn sandbox_root(&self) -> &Path {
        self.sandbox.root()
    }
}

/// Errors raised by tool handlers. Never exposed to clients directly — the
/// registry always wraps these into a `ToolResult`.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tier does not permit this tool: {0}")]
    TierDenied(String),
    #[error("external tool server error: {0}")]
    ExternalServer(String),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<ToolError> for crate::error::GatewayError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments(message) | ToolError::TierDenied(message) => {
                crate::error::GatewayError::InvalidRequest { message }
            }
            other => crate::error::GatewayError::Upstream {
                cause: Some(other.to_string()),
            },
        }
    }
}

/// Outcome of one tool call. `Err` is carried in-band as `ToolResult::Error`
/// rather than as a `Result` so that a failed tool call can be reported back
/// to the model as content instead of aborting the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Ok { content: String },
    Error { message: String },
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        ToolResult::Ok {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult::Error {
            message: message.into(),
        }
    }

    /// Empty tool output is rewritten to a single placeholder chunk rather
    /// than an empty content list.
    pub fn from_raw(content: String) -> Self {
        if content.is_empty() {
            ToolResult::ok("(empty result)")
        } else {
            ToolResult::ok(content)
        }
    }
}

/// Schema and metadata for one tool, independent of built-in/external origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A built-in tool implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: serde_json::Value, context: &UserContext) -> Result<String, ToolError>;
}
