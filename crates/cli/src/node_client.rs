//! Reference `NodeClient`/`StreamingGeneration` implementation against an
//! Ollama-compatible HTTP endpoint.
//!
//! The core crate deliberately leaves the wire protocol to a `NodeClient`
//! callers plug in. This module is that plug-in for the `chatgated` binary:
//! the same `/api/chat` request shape and the same
//! `{ message: { content }, done }` NDJSON stream shape Ollama speaks.

use std::time::Duration;

use async_trait::async_trait;
use chatgate_core::cluster::{GenerationRequest, NodeClient};
use chatgate_core::error::GatewayError;
use chatgate_core::storage::MessageRole;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OllamaNodeClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaNodeClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessageBody<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageBody<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponseLine {
    message: Option<ChatResponseMessage>,
    done: bool,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

#[async_trait]
impl NodeClient for OllamaNodeClient {
    async fn is_available(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Tag {
            name: String,
        }
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<Tag>,
        }
        let resp: TagsResponse = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.models.into_iter().map(|t| t.name).collect())
    }

    async fn web_search(&self, _query: &str, _max: usize) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("this node does not implement web search")
    }

    async fn probe_latency(&self) -> Option<Duration> {
        let start = std::time::Instant::now();
        self.is_available().await.then(|| start.elapsed())
    }
}

pub struct OllamaGenerator {
    client: OllamaNodeClient,
    model: String,
}

impl OllamaGenerator {
    pub fn new(client: OllamaNodeClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl chatgate_core::cluster::StreamingGeneration for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &GenerationRequest,
        on_token: &mut (dyn FnMut(&str) -> Result<(), GatewayError> + Send),
    ) -> Result<String, GatewayError> {
        let mut messages: Vec<ChatMessageBody> = prompt
            .history
            .iter()
            .map(|m| ChatMessageBody {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        messages.push(ChatMessageBody {
            role: "user",
            content: &prompt.message,
        });

        let body = ChatRequestBody {
            model: &self.model,
            messages,
            stream: true,
        };

        let text = self
            .client
            .http
            .post(format!("{}/api/chat", self.client.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { cause: Some(e.to_string()) })?
            .text()
            .await
            .map_err(|e| GatewayError::Upstream { cause: Some(e.to_string()) })?;

        let mut full = String::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ChatResponseLine = serde_json::from_str(line)
                .map_err(|e| GatewayError::Upstream { cause: Some(e.to_string()) })?;
            if let Some(message) = parsed.message {
                on_token(&message.content)?;
                full.push_str(&message.content);
            }
            if parsed.done {
                break;
            }
        }
        Ok(full)
    }
}
