pub mod exec;
pub mod file;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{GuardError, Result};
use crate::fetch::BoundedFetcher;
use crate::script::ScriptRunner;
use crate::security::{EgressGuard, ScratchFs, SystemResolver};

/// Output from a tool execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            metadata: None,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            metadata: None,
        }
    }

    pub fn ok_with_meta(output: impl Into<String>, meta: serde_json::Value) -> Self {
        Self {
            success: true,
            output: output.into(),
            metadata: Some(meta),
        }
    }
}

/// One request read from the caller.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Echoed back untouched so callers can match replies to requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// Shared context passed to tools during execution.
pub struct ToolContext {
    pub sandbox: ScratchFs,
    pub fetcher: Arc<BoundedFetcher>,
    pub scripts: ScriptRunner,
}

impl ToolContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        let sandbox = ScratchFs::new(&config.scratch_root)?;
        let guard = EgressGuard::new(
            Arc::new(SystemResolver),
            &config.egress.extra_blocked_hostnames,
        );
        let fetcher = BoundedFetcher::new(config.fetch.clone(), guard)
            .map_err(|e| GuardError::Config(e.to_string()))?;
        Ok(Self {
            sandbox,
            fetcher: Arc::new(fetcher),
            scripts: ScriptRunner::new(config.process.clone()),
        })
    }
}

/// The trait all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool (e.g. "read_file", "fetch_url").
    fn name(&self) -> &str;

    /// Human-readable description for the calling agent.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool.  Refusals are reported as `ToolOutput::error`,
    /// never as `Err`.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Registry of all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry holding every built-in operation.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(file::ReadFileTool));
        registry.register(Box::new(file::WriteFileTool));
        registry.register(Box::new(file::DeleteFileTool));
        registry.register(Box::new(file::ListFilesTool));
        registry.register(Box::new(web::FetchUrlTool));
        registry.register(Box::new(exec::RunScriptTool));
        registry
    }

    /// Register a tool. Panics on duplicate names.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        assert!(
            !self.tools.contains_key(&name),
            "duplicate tool name: {name}"
        );
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// (name, description) pairs sorted by name.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut items: Vec<_> = self
            .tools
            .values()
            .map(|t| (t.name(), t.description()))
            .collect();
        items.sort_by_key(|(name, _)| *name);
        items
    }

    /// Every tool with its parameter schema, for callers that want to
    /// advertise the surface.
    pub fn schemas(&self) -> serde_json::Value {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by_key(|t| t.name());
        serde_json::Value::Array(
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    })
                })
                .collect(),
        )
    }

    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| GuardError::ToolNotFound(name.to_string()))?;
        tool.execute(params, ctx).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
