//! Unified built-in + external tool registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::context::{Tool, ToolDefinition, ToolResult, UserContext};
use crate::rate_limit::Tier;

/// Separator between an external server's name and a tool's original name.
/// Not valid inside a bare tool name.
pub const NAMESPACE_SEPARATOR: &str = "::";

const FREE_TOOLS: &[&str] = &["web_search", "vision_ocr", "analyze_image"];
const PRO_EXTRA_TOOLS: &[&str] = &["run_command", "sequential_thinking"];

/// Executor for a registered external tool server. `call_tool`
/// always receives the *original*, non-namespaced name.
#[async_trait]
pub trait ExternalExecutor: Send + Sync {
    async fn call_tool(&self, original_name: &str, args: serde_json::Value) -> ToolResult;
}

struct ExternalServer {
    server_name: String,
    tools: Vec<ToolDefinition>,
    executor: Arc<dyn ExternalExecutor>,
}

#[derive(Default)]
struct Inner {
    builtins: HashMap<String, Arc<dyn Tool>>,
    external: HashMap<String, ExternalServer>,
}

/// Namespaced view over built-in tools and externally discovered tools.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.inner.write().builtins.insert(name, tool);
    }

    /// Replaces any prior registration for `server_id`.
    pub fn register_external(
        &self,
        server_id: String,
        server_name: String,
        tools: Vec<ToolDefinition>,
        executor: Arc<dyn ExternalExecutor>,
    ) {
        self.inner.write().external.insert(
            server_id,
            ExternalServer {
                server_name,
                tools,
                executor,
            },
        );
    }

    pub fn unregister_external(&self, server_id: &str) {
        self.inner.write().external.remove(server_id);
    }

    /// Built-ins in original names, external tools as `serverName::originalName`.
    pub fn list_all(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read();
        let mut out: Vec<ToolDefinition> = inner
            .builtins
            .values()
            .map(|tool| tool.definition())
            .collect();
        for server in inner.external.values() {
            for def in &server.tools {
                out.push(ToolDefinition {
                    name: format!("{}{}{}", server.server_name, NAMESPACE_SEPARATOR, def.name),
                    ..def.clone()
                });
            }
        }
        out
    }

    /// Filtered by the tier policy.
    pub fn list_for_tier(&self, tier: Tier) -> Vec<ToolDefinition> {
        self.list_all()
            .into_iter()
            .filter(|def| tier_allows(tier, &def.name))
            .collect()
    }

    /// Tier check, sandbox rewrite, then route.
    pub async fn execute(&self, name: &str, mut args: serde_json::Value, context: &UserContext) -> ToolResult {
        if !tier_allows(context.tier, name) {
            return ToolResult::error(format!("tool not permitted for this tier: {name}"));
        }

        context.sandbox.rewrite_arguments(&mut args);

        if let Some((server_name, original_name)) = name.split_once(NAMESPACE_SEPARATOR) {
            return self.execute_external(server_name, original_name, args).await;
        }

        let tool = {
            let inner = self.inner.read();
            inner.builtins.get(name).cloned()
        };
        match tool {
            Some(tool) => match tool.call(args, context).await {
                Ok(content) => ToolResult::from_raw(content),
                Err(err) => ToolResult::error(err.to_string()),
            },
            None => ToolResult::error(format!("unknown tool: {name}")),
        }
    }

    async fn execute_external(&self, server_name: &str, original_name: &str, args: serde_json::Value) -> ToolResult {
        let executor = {
            let inner = self.inner.read();
            inner
                .external
                .values()
                .find(|s| s.server_name == server_name)
                .map(|s| Arc::clone(&s.executor))
        };
        match executor {
            Some(executor) => executor.call_tool(original_name, args).await,
            None => ToolResult::error(format!("unknown external server: {server_name}")),
        }
    }
}

/// Matching rules: exact match; `prefix*` wildcard; `::`-bearing
/// names go through the external branch.
fn tier_allows(tier: Tier, name: &str) -> bool {
    if name.contains(NAMESPACE_SEPARATOR) {
        return matches!(tier, Tier::Pro | Tier::Enterprise);
    }

    match tier {
        Tier::Enterprise => true,
        Tier::Free => FREE_TOOLS.contains(&name),
        Tier::Pro => {
            FREE_TOOLS.contains(&name)
                || PRO_EXTRA_TOOLS.contains(&name)
                || matches_wildcard(name, "firecrawl_*")
        }
    }
}

fn matches_wildcard(name: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::ToolError;
    use chatgate_sandbox::SandboxRegistry;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.0.to_string(),
                description: "test".into(),
                input_schema: serde_json::json!({}),
            }
        }
        async fn call(&self, _args: serde_json::Value, _context: &UserContext) -> Result<String, ToolError> {
            Ok("echo".into())
        }
    }

    struct FakeExternal;
    #[async_trait]
    impl ExternalExecutor for FakeExternal {
        async fn call_tool(&self, original_name: &str, _args: serde_json::Value) -> ToolResult {
            ToolResult::ok(format!("called:{original_name}"))
        }
    }

    fn ctx(tier: Tier) -> UserContext {
        let registry = SandboxRegistry::new(std::env::temp_dir());
        UserContext {
            principal_id: "p1".into(),
            role: crate::rate_limit::Role::User,
            tier,
            sandbox: Arc::new(registry.for_principal("p1")),
        }
    }

    #[test]
    fn free_tier_has_exactly_three_tools() {
        for name in FREE_TOOLS {
            assert!(tier_allows(Tier::Free, name));
        }
        assert!(!tier_allows(Tier::Free, "run_command"));
        assert!(!tier_allows(Tier::Free, "server::tool"));
    }

    #[test]
    fn pro_tier_adds_firecrawl_wildcard() {
        assert!(tier_allows(Tier::Pro, "firecrawl_scrape"));
        assert!(tier_allows(Tier::Pro, "run_command"));
        assert!(tier_allows(Tier::Pro, "server::tool"));
    }

    #[test]
    fn enterprise_allows_everything() {
        assert!(tier_allows(Tier::Enterprise, "anything_goes"));
    }

    #[tokio::test]
    async fn free_tier_execute_rejects_namespaced_tool() {
        let registry = ToolRegistry::new();
        registry.register_external(
            "srv1".into(),
            "srv".into(),
            vec![ToolDefinition {
                name: "tool".into(),
                description: "".into(),
                input_schema: serde_json::json!({}),
            }],
            Arc::new(FakeExternal),
        );

        let result = registry
            .execute("srv::tool", serde_json::json!({}), &ctx(Tier::Free))
            .await;
        assert!(matches!(result, ToolResult::Error { .. }));
    }

    #[tokio::test]
    async fn execute_routes_to_original_name_for_external_tool() {
        let registry = ToolRegistry::new();
        registry.register_external(
            "srv1".into(),
            "srv".into(),
            vec![ToolDefinition {
                name: "tool".into(),
                description: "".into(),
                input_schema: serde_json::json!({}),
            }],
            Arc::new(FakeExternal),
        );

        let result = registry
            .execute("srv::tool", serde_json::json!({}), &ctx(Tier::Pro))
            .await;
        match result {
            ToolResult::Ok { content } => assert_eq!(content, "called:tool"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_result_not_panic() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute("does_not_exist", serde_json::json!({}), &ctx(Tier::Enterprise))
            .await;
        assert!(matches!(result, ToolResult::Error { .. }));
    }

    #[tokio::test]
    async fn register_external_replaces_prior_registration() {
        let registry = ToolRegistry::new();
        registry.register_external(
            "srv1".into(),
            "srv".into(),
            vec![ToolDefinition {
                name: "old".into(),
                description: "".into(),
                input_schema: serde_json::json!({}),
            }],
            Arc::new(FakeExternal),
        );
        registry.register_external(
            "srv1".into(),
            "srv".into(),
            vec![ToolDefinition {
                name: "new".into(),
                description: "".into(),
                input_schema: serde_json::json!({}),
            }],
            Arc::new(FakeExternal),
        );

        let names: Vec<String> = registry.list_all().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"srv::new".to_string()));
        assert!(!names.contains(&"srv::old".to_string()));
    }

    #[tokio::test]
    async fn unregister_external_removes_all_its_tools() {
        let registry = ToolRegistry::new();
        registry.register_builtin(Arc::new(Echo("web_search")));
        registry.register_external(
            "srv1".into(),
            "srv".into(),
            vec![ToolDefinition {
                name: "tool".into(),
                description: "".into(),
                input_schema: serde_json::json!({}),
            }],
            Arc::new(FakeExternal),
        );
        registry.unregister_external("srv1");

        let names: Vec<String> = registry.list_all().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["web_search".to_string()]);
    }

    #[test]
    fn list_for_free_tier_contains_exactly_the_three_builtins() {
        let registry = ToolRegistry::new();
        registry.register_builtin(Arc::new(Echo("web_search")));
        registry.register_builtin(Arc::new(Echo("vision_ocr")));
        registry.register_builtin(Arc::new(Echo("analyze_image")));
        registry.register_builtin(Arc::new(Echo("run_command")));

        let mut names: Vec<String> = registry
            .list_for_tier(Tier::Free)
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["analyze_image", "vision_ocr", "web_search"]);
    }
}
