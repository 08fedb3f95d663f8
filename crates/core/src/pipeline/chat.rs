//! Per-turn orchestration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use super::model_select::{needs_selection, select_model};
use crate::cluster::manager::ClusterManager;
use crate::cluster::node::GenerationRequest;
use crate::error::GatewayError;
use crate::rate_limit::RateLimiter;
use crate::storage::{ConversationStore, MessageRole};
use crate::tools::{ToolRegistry, UserContext};

/// Mode flags carried on a `ChatTurn`. None of these are
/// interpreted by the pipeline itself — they are forwarded verbatim to the
/// node's generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeFlags {
    #[serde(default)]
    pub discussion: bool,
    #[serde(default)]
    pub deep_research: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub thinking_level: Option<u8>,
}

/// Session id length floor: ids shorter than this are reserved for node
/// identifiers and are never reused as a session id.
const MIN_CLIENT_SESSION_ID_LEN: usize = 10;

/// Inbound shape of one `chat` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub images: Vec<Vec<u8>>,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub web_search_context: Option<String>,
    #[serde(default)]
    pub mode: ModeFlags,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub model: String,
}

/// Fired by an `abort` frame, session close, heartbeat failure, or server
/// shutdown. One handle per in-flight
/// turn; cloning shares the same flag.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), GatewayError> {
        if self.is_cancelled() {
            Err(GatewayError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Duplex callbacks the session handler passes into a turn.
pub trait ChatCallbacks: Send {
    fn on_session_created(&mut self, session_id: &str);
    fn on_agent_selected(&mut self, node_id: &str, model: &str);
    fn on_token(&mut self, token: &str);
}

pub struct ChatPipeline {
    rate_limiter: Arc<RateLimiter>,
    cluster: Arc<ClusterManager>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
}

impl ChatPipeline {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        cluster: Arc<ClusterManager>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            rate_limiter,
            cluster,
            tools,
            store,
        }
    }

    /// Validate, rate-limit, acquire a node, bind the session, persist the
    /// inbound message, generate, persist the reply, then respond.
    ///
    /// `principal_key` is the rate-limit quota key (authenticated user id,
    /// anonymous session id, or `"guest"`); `user_id` is the real
    /// authenticated identity, or `None` for a guest, and is what gets
    /// persisted on the session row.
    pub async fn process_chat(
        &self,
        request: ChatRequest,
        principal_key: &str,
        user_id: Option<&str>,
        context: &UserContext,
        cancellation: &CancellationHandle,
        callbacks: &mut dyn ChatCallbacks,
    ) -> Result<ChatResponse, GatewayError> {
        // 1. Validate.
        if request.message.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "메시지가 필요합니다".into(),
            });
        }

        // 2. Resolve model.
        let model = if needs_selection(request.model.as_deref()) {
            select_model(&request.message).to_string()
        } else {
            request.model.clone().unwrap()
        };

        // 3. Rate limit.
        self.rate_limiter.check(principal_key, context.role, context.tier).await?;
        cancellation.check()?;

        // 4. Acquire node.
        let node_id = match &request.node_id {
            Some(id) => id.clone(),
            None => self
                .cluster
                .get_best_node(Some(&model))
                .await
                .ok_or(GatewayError::NoNodeAvailable)?
                .id(),
        };
        let scoped = self
            .cluster
            .create_scoped_client(&node_id, Some(&model))
            .await
            .ok_or(GatewayError::NoNodeAvailable)?;
        callbacks.on_agent_selected(&scoped.node_id, &scoped.model);
        cancellation.check()?;

        // 5. Session bind.
        let session_id = match &request.session_id {
            Some(id) if id.len() >= MIN_CLIENT_SESSION_ID_LEN => id.clone(),
            _ => {
                let title: String = request.message.chars().take(30).collect();
                let id = self
                    .store
                    .create_session(user_id, &title, None, request.session_id.as_deref())
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                callbacks.on_session_created(&id);
                id
            }
        };
        cancellation.check()?;

        // 6. Persist user turn.
        if let Err(err) = self.store.add_message(&session_id, MessageRole::User, &request.message, None).await {
            tracing::warn!(error = %err, "failed to persist user turn, continuing");
        }

        // 7. Drive generation.
        let enabled_tools: Vec<String> = request
            .enabled_tools
            .iter()
            .filter(|name| self.tools.list_for_tier(context.tier).iter().any(|t| &t.name == *name))
            .cloned()
            .collect();

        let history = self.store.history(&session_id).await.unwrap_or_default();
        let prompt = GenerationRequest {
            message: request.message.clone(),
            history,
            images: request.images,
            doc_id: request.doc_id,
            web_search_context: request.web_search_context,
            mode: request.mode,
            enabled_tools,
        };

        let response = {
            let cancellation = cancellation.clone();
            let mut on_token = |token: &str| -> Result<(), GatewayError> {
                cancellation.check()?;
                callbacks.on_token(token);
                Ok(())
            };
            scoped.generate(&prompt, &mut on_token).await?
        };

        // 8. Persist assistant turn.
        if let Err(err) = self
            .store
            .add_message(&session_id, MessageRole::Assistant, &response, None)
            .await
        {
            tracing::warn!(error = %err, "failed to persist assistant turn, continuing");
        }

        // 9. Emit done (the session handler translates this return value into
        // the outbound `done` frame).
        Ok(ChatResponse {
            session_id,
            response,
            model: scoped.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_handle_is_shared_across_clones() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(handle.check(), Err(GatewayError::Aborted)));
    }

    #[test]
    fn fresh_handle_is_not_cancelled() {
        let handle = CancellationHandle::new();
        assert!(handle.check().is_ok());
    }
}
