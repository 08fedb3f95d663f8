//! Outbound connection to one external tool server.
//!
//! Three `rmcp` transports are supported (stdio child process, SSE,
//! streamable HTTP), each following the same connect-then-discover flow.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, ProtocolVersion};
use rmcp::service::{DynService, RunningService};
use rmcp::{RoleClient, ServiceExt};
use serde::{Deserialize, Serialize};

use super::context::{ToolDefinition, ToolResult};
use super::registry::ExternalExecutor;

/// Transport configuration for one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ExternalTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        token: Option<String>,
    },
    StreamableHttp {
        url: String,
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Failed,
}

type Service = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

/// One connection to an external tool server. `call_tool` is always given
/// the original (non-namespaced) tool name — namespacing is the registry's
/// concern.
pub struct ExternalToolClient {
    server_name: String,
    transport: ExternalTransportConfig,
    service: RwLock<Option<Service>>,
    status: RwLock<ConnectionStatus>,
    tools_cache: RwLock<Option<Vec<ToolDefinition>>>,
}

impl ExternalToolClient {
    pub fn new(server_name: String, transport: ExternalTransportConfig) -> Self {
        Self {
            server_name,
            transport,
            service: RwLock::new(None),
            status: RwLock::new(ConnectionStatus::Disconnected),
            tools_cache: RwLock::new(None),
        }
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        let client_info = ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "chatgate".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let result = self.start_transport(client_info).await;
        match result {
            Ok(service) => {
                *self.service.write() = Some(service);
                *self.status.write() = ConnectionStatus::Connected;
                Ok(())
            }
            Err(err) => {
                *self.status.write() = ConnectionStatus::Failed;
                Err(err)
            }
        }
    }

    async fn start_transport(&self, client_info: ClientInfo) -> anyhow::Result<Service> {
        match &self.transport {
            ExternalTransportConfig::Sse { url, token } => {
                let transport = match token {
                    Some(t) => {
                        let mut headers = reqwest::header::HeaderMap::new();
                        headers.insert(
                            reqwest::header::AUTHORIZATION,
                            reqwest::header::HeaderValue::from_str(&format!("Bearer {t}"))?,
                        );
                        let client = reqwest::ClientBuilder::new().default_headers(headers).build()?;
                        rmcp::transport::SseClientTransport::start_with_client(
                            client,
                            rmcp::transport::sse_client::SseClientConfig {
                                sse_endpoint: url.clone().into(),
                                ..Default::default()
                            },
                        )
                        .await?
                    }
                    None => rmcp::transport::SseClientTransport::start(url.as_str()).await?,
                };
                Ok(client_info.into_dyn().serve(transport).await?)
            }
            ExternalTransportConfig::StreamableHttp { url, token } => {
                let transport = match token {
                    Some(t) => {
                        let mut headers = reqwest::header::HeaderMap::new();
                        headers.insert(
                            reqwest::header::AUTHORIZATION,
                            reqwest::header::HeaderValue::from_str(&format!("Bearer {t}"))?,
                        );
                        let client = reqwest::ClientBuilder::new().default_headers(headers).build()?;
                        rmcp::transport::StreamableHttpClientTransport::with_client(
                            client,
                            rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig {
                                uri: url.clone().into(),
                                ..Default::default()
                            },
                        )
                    }
                    None => rmcp::transport::StreamableHttpClientTransport::from_uri(url.clone()),
                };
                Ok(client_info.into_dyn().serve(transport).await?)
            }
            ExternalTransportConfig::Stdio { command, args, envs } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args)
                    .envs(envs)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)?;
                Ok(client_info.into_dyn().serve(transport).await?)
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Some(service) = self.service.write().take() {
            let _ = service.cancel().await;
        }
        *self.status.write() = ConnectionStatus::Disconnected;
        *self.tools_cache.write() = None;
    }

    /// Discover tools and report them back to the caller for registration.
    /// Cached after the first successful discovery; `disconnect` clears the
    /// cache so a later reconnect re-discovers rather than serving stale
    /// tool definitions.
    pub async fn get_tools(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        if let Some(cached) = self.tools_cache.read().as_ref() {
            return Ok(cached.clone());
        }

        let tools = {
            let service = self.service.read();
            let Some(service) = service.as_ref() else {
                anyhow::bail!("not connected to {}", self.server_name);
            };
            service.list_all_tools().await?
        };
        let defs: Vec<ToolDefinition> = tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name.into_owned(),
                description: tool.description.map(|d| d.into_owned()).unwrap_or_default(),
                input_schema: serde_json::Value::Object(
                    tool.input_schema.as_ref().clone(),
                ),
            })
            .collect();
        *self.tools_cache.write() = Some(defs.clone());
        Ok(defs)
    }

    /// Invoke `original_name` — the server never sees the namespaced
    /// `server::tool` form. An empty content result is rewritten to
    /// `(empty result)`.
    pub async fn call_tool(&self, original_name: &str, args: serde_json::Value) -> ToolResult {
        let arguments = match args {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };

        let service = self.service.read();
        let Some(service) = service.as_ref() else {
            return ToolResult::error(format!("{} is not connected", self.server_name));
        };

        let result = service
            .call_tool(CallToolRequestParam {
                name: original_name.to_string().into(),
                arguments,
            })
            .await;

        match result {
            Ok(call_result) => match serde_json::to_string(&call_result.content) {
                Ok(content) => ToolResult::from_raw(content),
                Err(err) => ToolResult::error(err.to_string()),
            },
            Err(err) => ToolResult::error(err.to_string()),
        }
    }

    pub async fn ping(&self) -> bool {
        let service = self.service.read();
        match service.as_ref() {
            Some(service) => service.peer().list_resources(None).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ExternalExecutor for ExternalToolClient {
    async fn call_tool(&self, original_name: &str, args: serde_json::Value) -> ToolResult {
        ExternalToolClient::call_tool(self, original_name, args).await
    }
}

/// Connects every configured server and returns an executor handle for each,
/// keyed by server id.
pub async fn connect_all(
    servers: Vec<(String, String, ExternalTransportConfig)>,
) -> Vec<(String, String, Arc<ExternalToolClient>)> {
    let mut clients = Vec::with_capacity(servers.len());
    for (server_id, server_name, transport) in servers {
        let client = Arc::new(ExternalToolClient::new(server_name.clone(), transport));
        if let Err(err) = client.connect().await {
            tracing::warn!(server = server_name, error = %err, "external tool server failed to connect");
        }
        clients.push((server_id, server_name, client));
    }
    clients
}
