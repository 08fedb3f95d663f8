//! Process entry point for the `chatgated` daemon: load config, wire the
//! request-serving plane, accept duplex connections on axum.

mod node_client;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use chatgate_core::auth::{Principal, TokenVerifier};
use chatgate_core::cluster::ClusterManager;
use chatgate_core::config::{self, AppConfig};
use chatgate_core::events::ClusterEventBus;
use chatgate_core::pipeline::ChatPipeline;
use chatgate_core::rate_limit::{RateLimiter, SqliteRateLimitStore};
use chatgate_core::session::SessionHandler;
use chatgate_core::storage::SqliteConversationStore;
use chatgate_core::tools::{self, ToolRegistry};

use node_client::{OllamaGenerator, OllamaNodeClient};

#[derive(Parser, Debug)]
#[command(name = "chatgated", about = "chatgate LLM gateway daemon")]
struct Cli {
    /// Path to a TOML config file. Falls back to built-in defaults if absent.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Always resolves to [`Principal::guest`]: this binary ships with no token
/// backend of its own. Deployments wire their own verifier.
struct GuestOnlyVerifier;

#[async_trait::async_trait]
impl TokenVerifier for GuestOnlyVerifier {
    async fn verify(&self, _token: &str) -> Option<Principal> {
        None
    }
}

struct AppState {
    handler: Arc<SessionHandler>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let app_config = match &cli.config {
        Some(path) => config::load_config(path.clone()).await?,
        None => AppConfig::default(),
    };

    let db_url = format!("sqlite://{}?mode=rwc", app_config.db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .with_context(|| format!("failed to open database at {:?}", app_config.db_path))?;

    let rate_limit_store = Arc::new(SqliteRateLimitStore::new(pool.clone()).await?);
    let rate_limiter = Arc::new(RateLimiter::new(rate_limit_store));
    rate_limiter.spawn_sweeper();

    let conversation_store = Arc::new(SqliteConversationStore::new(pool.clone()).await?);

    let events = ClusterEventBus::new();
    let cluster = ClusterManager::new(events.clone(), std::time::Duration::from_secs(app_config.health_check_interval_secs));

    let mut seed_nodes = Vec::new();
    for node in &app_config.nodes {
        let client: Arc<dyn chatgate_core::cluster::NodeClient> =
            Arc::new(OllamaNodeClient::new(&node.host, node.port));
        let model = node.models.first().cloned().unwrap_or_else(|| "default".to_string());
        let generator: Arc<dyn chatgate_core::cluster::StreamingGeneration> =
            Arc::new(OllamaGenerator::new(OllamaNodeClient::new(&node.host, node.port), model));
        seed_nodes.push((node.host.clone(), node.port, Some(node.name.clone()), client, generator));
    }
    cluster.start(seed_nodes).await;

    let tool_registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tool_registry);

    let external_servers: Vec<(String, String, tools::ExternalTransportConfig)> = app_config
        .tools
        .iter()
        .map(|t| (t.name.clone(), t.name.clone(), t.transport.clone()))
        .collect();
    for (server_id, server_name, client) in tools::connect_all(external_servers).await {
        match client.get_tools().await {
            Ok(defs) => tool_registry.register_external(server_id, server_name, defs, client),
            Err(err) => tracing::warn!(server = server_name, error = %err, "failed to list tools for external server"),
        }
    }

    let sandboxes = Arc::new(chatgate_sandbox::SandboxRegistry::new(app_config.sandbox_root.clone()));

    let pipeline = Arc::new(ChatPipeline::new(
        Arc::clone(&rate_limiter),
        Arc::clone(&cluster),
        Arc::clone(&tool_registry),
        conversation_store,
    ));

    let handler = SessionHandler::new(
        Arc::clone(&cluster),
        Arc::clone(&tool_registry),
        pipeline,
        Arc::new(GuestOnlyVerifier),
        sandboxes,
        events,
    );
    handler.spawn_heartbeat();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(AppState { handler }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = app_config.bind_addr.parse().context("invalid bind_addr")?;
    tracing::info!(%addr, "chatgated listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn register_builtin_tools(registry: &ToolRegistry) {
    use chatgate_core::tools::builtins::{AnalyzeImageTool, RunCommandTool, SequentialThinkingTool, VisionOcrTool, WebSearchTool};

    registry.register_builtin(Arc::new(VisionOcrTool));
    registry.register_builtin(Arc::new(AnalyzeImageTool));
    registry.register_builtin(Arc::new(RunCommandTool));
    registry.register_builtin(Arc::new(SequentialThinkingTool));
    registry.register_builtin(Arc::new(WebSearchTool::new(|_query: String, _max: usize| async move {
        Ok(Vec::new())
    })));
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let cookie_header = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let authorization_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| async move {
        state.handler.handle_socket(socket, cookie_header, authorization_header).await;
    })
}
