//! TOML configuration loading.
//!
//! A `serde(deny_unknown_fields)` struct with per-field
//! `#[serde(default = "...")]` helpers so that every tunable operational
//! constant has a documented default and can still be overridden from a
//! deployment's TOML file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tools::ExternalTransportConfig;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chatgate.db")
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_rate_limit_sweep_secs() -> u64 {
    60
}

fn default_rate_limit_cache_capacity() -> u64 {
    10_000
}

fn default_health_check_interval_secs() -> u64 {
    15
}

/// One external tool server entry in `[[tools]]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: ExternalTransportConfig,
}

/// Root of a deployment's TOML config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    /// Address the duplex server binds to.
    pub bind_addr: String,
    /// Path to the sqlite database backing conversations and rate limits.
    pub db_path: PathBuf,
    /// Root directory for per-principal tool sandboxes.
    pub sandbox_root: PathBuf,
    /// Heartbeat tick for duplex sessions.
    pub heartbeat_secs: u64,
    /// Inbound frame size ceiling.
    pub max_frame_bytes: usize,
    /// Rate-limit cache sweep interval.
    pub rate_limit_sweep_secs: u64,
    /// Rate-limit in-process cache capacity.
    pub rate_limit_cache_capacity: u64,
    /// Cluster health-probe interval.
    pub health_check_interval_secs: u64,
    /// External MCP-like tool servers to connect at startup.
    pub tools: Vec<ToolServerConfig>,
    /// Static node seed list, in addition to any runtime registration calls.
    pub nodes: Vec<SeedNodeConfig>,
}

/// A node known at startup, before any dynamic `add_node` call registers it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SeedNodeConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub models: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            sandbox_root: PathBuf::from("sandboxes"),
            heartbeat_secs: default_heartbeat_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            rate_limit_sweep_secs: default_rate_limit_sweep_secs(),
            rate_limit_cache_capacity: default_rate_limit_cache_capacity(),
            health_check_interval_secs: default_health_check_interval_secs(),
            tools: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

/// Source for loading the app configuration: a file path, or TOML text
/// already in hand.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Path(PathBuf),
    Toml(String),
}

impl<T> From<T> for ConfigSource
where
    T: AsRef<Path>,
{
    fn from(value: T) -> Self {
        Self::Path(value.as_ref().to_path_buf())
    }
}

pub async fn load_config(source: impl Into<ConfigSource>) -> Result<AppConfig> {
    let content = match source.into() {
        ConfigSource::Path(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read config file: {path:?}"))?,
        ConfigSource::Toml(content) => content,
    };

    let content = interpolate_env_vars(&content)?;
    toml::from_str(&content).context("failed to parse config TOML")
}

/// `${VAR}` / `${VAR:-default}` interpolation, applied to the raw TOML text
/// before parsing.
fn interpolate_env_vars(content: &str) -> Result<String> {
    let mut errors: Vec<String> = Vec::new();
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let end = start + end;
        let inner = &rest[start + 2..end];
        let (var_name, default) = match inner.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };
        match (std::env::var(var_name), default) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(default)) => out.push_str(default),
            (Err(_), None) => errors.push(var_name.to_string()),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    if !errors.is_empty() {
        anyhow::bail!("required environment variables not set: {}", errors.join(", "));
    }
    Ok(out)
}

/// Group seed node configs into the shape the cluster manager's
/// registration call expects, keyed by `host:port`.
pub fn seed_node_map(nodes: &[SeedNodeConfig]) -> HashMap<String, SeedNodeConfig> {
    nodes.iter().map(|n| (format!("{}:{}", n.host, n.port), n.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_apply_when_file_is_empty() {
        let cfg = load_config(ConfigSource::Toml(String::new())).await.unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.rate_limit_cache_capacity, 10_000);
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
    }

    #[tokio::test]
    async fn interpolates_env_var_with_fallback() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("CHATGATE_TEST_BIND", "127.0.0.1:9000");
        }
        let toml = r#"bind_addr = "${CHATGATE_TEST_BIND}""#;
        let cfg = load_config(ConfigSource::Toml(toml.to_string())).await.unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn missing_required_env_var_errors() {
        let toml = r#"bind_addr = "${CHATGATE_DEFINITELY_MISSING}""#;
        let err = load_config(ConfigSource::Toml(toml.to_string())).await.unwrap_err();
        assert!(err.to_string().contains("CHATGATE_DEFINITELY_MISSING"));
    }

    #[tokio::test]
    async fn unknown_field_rejected() {
        let toml = r#"not_a_real_field = 1"#;
        assert!(load_config(ConfigSource::Toml(toml.to_string())).await.is_err());
    }

    #[test]
    fn seed_node_map_keys_by_host_port() {
        let nodes = vec![SeedNodeConfig {
            host: "10.0.0.1".into(),
            port: 8000,
            name: "gpu-1".into(),
            models: vec!["llama3".into()],
        }];
        let map = seed_node_map(&nodes);
        assert!(map.contains_key("10.0.0.1:8000"));
    }
}
