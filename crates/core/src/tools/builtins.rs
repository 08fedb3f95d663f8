//! Built-in tool implementations.
//!
//! A small struct per tool, a JSON-schema `definition()`, and a `call()`
//! that reads its arguments out of a bare `serde_json::Value` rather than
//! a typed request struct.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::context::{Tool, ToolDefinition, ToolError, UserContext};

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("`{key}` is required")))
}

/// Reads a path argument already rewritten by the registry's sandbox pass
/// before dispatch. Never calls `resolve_path` itself — doing so on an
/// already-rewritten escape sentinel would treat it as a harmless relative
/// filename and defeat the refusal.
fn sandboxed_path_arg(args: &Value, key: &str) -> Result<std::path::PathBuf, ToolError> {
    let value = arg_str(args, key)?;
    if value == chatgate_sandbox::ESCAPE_SENTINEL {
        return Err(ToolError::InvalidArguments(format!("`{key}` escapes the sandbox root")));
    }
    Ok(std::path::PathBuf::from(value))
}

/// `free` tier: a text search against the web, delegated to
/// whichever `ScopedClient` the turn already holds. The tool itself has no
/// opinion on which node answers it — that's wired in by the pipeline at
/// registration time via [`WebSearchTool::new`].
pub struct WebSearchTool {
    search: Box<dyn Fn(&str, usize) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Vec<String>>> + Send>> + Send + Sync>,
}

impl WebSearchTool {
    pub fn new<F, Fut>(search: F) -> Self
    where
        F: Fn(String, usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
    {
        Self {
            search: Box::new(move |query, max| {
                let query = query.to_string();
                Box::pin(search(query, max))
            }),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the web and return a list of result snippets.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer", "default": 5}
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Value, _context: &UserContext) -> Result<String, ToolError> {
        let query = arg_str(&args, "query")?;
        let max_results = args.get("max_results").and_then(Value::as_u64).unwrap_or(5) as usize;

        let results = (self.search)(query, max_results)
            .await
            .map_err(ToolError::Other)?;
        serde_json::to_string(&results).map_err(|e| ToolError::Other(e.into()))
    }
}

/// `free` tier: OCR a sandboxed image path.
pub struct VisionOcrTool;

#[async_trait]
impl Tool for VisionOcrTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "vision_ocr".into(),
            description: "Extract text from an image via OCR.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn call(&self, args: Value, _context: &UserContext) -> Result<String, ToolError> {
        let resolved = sandboxed_path_arg(&args, "path")?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::Other(e.into()))?;
        Ok(json!({ "path": resolved.display().to_string(), "bytes_read": bytes.len() }).to_string())
    }
}

/// `free` tier: describe the contents of a sandboxed image path.
pub struct AnalyzeImageTool;

#[async_trait]
impl Tool for AnalyzeImageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analyze_image".into(),
            description: "Produce a natural-language description of an image.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "prompt": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn call(&self, args: Value, _context: &UserContext) -> Result<String, ToolError> {
        let resolved = sandboxed_path_arg(&args, "path")?;
        if !resolved.exists() {
            return Err(ToolError::InvalidArguments(format!("no such file: {}", resolved.display())));
        }
        Ok(json!({ "path": resolved.display().to_string(), "description": "(image analysis pending upstream model call)" }).to_string())
    }
}

/// `pro` tier addition: run a shell command inside the principal's sandbox.
pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_command".into(),
            description: "Run a shell command inside the caller's sandbox root.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["command"]
            }),
        }
    }

    async fn call(&self, args: Value, context: &UserContext) -> Result<String, ToolError> {
        let command = arg_str(&args, "command")?;
        let arg_list: Vec<String> = args
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let output = tokio::process::Command::new(command)
            .args(&arg_list)
            .current_dir(context.sandbox_root())
            .output()
            .await
            .map_err(|e| ToolError::Other(e.into()))?;

        Ok(json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        })
        .to_string())
    }
}

/// `pro` tier addition: record one step of a scratchpad without invoking the
/// model — purely a structured-note tool for multi-step reasoning.
pub struct SequentialThinkingTool;

#[async_trait]
impl Tool for SequentialThinkingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "sequential_thinking".into(),
            description: "Record one step of a chain of thought for later reference.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "thought": {"type": "string"},
                    "step_number": {"type": "integer"},
                    "total_steps": {"type": "integer"}
                },
                "required": ["thought", "step_number"]
            }),
        }
    }

    async fn call(&self, args: Value, _context: &UserContext) -> Result<String, ToolError> {
        let thought = arg_str(&args, "thought")?;
        let step_number = args
            .get("step_number")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::InvalidArguments("`step_number` is required".into()))?;
        Ok(json!({ "acknowledged_step": step_number, "length": thought.len() }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_sandbox::SandboxRegistry;
    use std::sync::Arc;

    fn ctx(dir: &std::path::Path) -> UserContext {
        let registry = SandboxRegistry::new(dir.to_path_buf());
        UserContext {
            principal_id: "p1".into(),
            role: crate::rate_limit::Role::User,
            tier: crate::rate_limit::Tier::Free,
            sandbox: Arc::new(registry.for_principal("p1")),
        }
    }

    #[tokio::test]
    async fn web_search_returns_serialized_results() {
        let tool = WebSearchTool::new(|_query, _max| async { Ok(vec!["a".to_string(), "b".to_string()]) });
        let context = ctx(&std::env::temp_dir());
        let result = tool
            .call(json!({"query": "rust async"}), &context)
            .await
            .unwrap();
        let parsed: Vec<String> = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn web_search_requires_query_argument() {
        let tool = WebSearchTool::new(|_q, _m| async { Ok(vec![]) });
        let context = ctx(&std::env::temp_dir());
        let err = tool.call(json!({}), &context).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn analyze_image_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path());
        let tool = AnalyzeImageTool;
        // Path arrives already resolved, as the registry's sandbox rewrite would leave it.
        let absolute = dir.path().join("missing.png");
        let err = tool
            .call(json!({"path": absolute.display().to_string()}), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn analyze_image_rejects_escape_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path());
        let tool = AnalyzeImageTool;
        let err = tool
            .call(json!({"path": chatgate_sandbox::ESCAPE_SENTINEL}), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn run_command_runs_inside_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path());
        let tool = RunCommandTool;
        let result = tool
            .call(json!({"command": "pwd"}), &context)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["exit_code"], 0);
    }

    #[tokio::test]
    async fn sequential_thinking_acknowledges_step() {
        let context = ctx(&std::env::temp_dir());
        let tool = SequentialThinkingTool;
        let result = tool
            .call(json!({"thought": "first step", "step_number": 1}), &context)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["acknowledged_step"], 1);
    }
}
