use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::{Tool, ToolInvoker};
use weave_core::types::{ToolContext, ToolDefinition, ToolOutput};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| WeaveError::ToolNotFound(name.to_string()))?;

        debug!(tool = %name, execution_id = %ctx.execution_id, step = ?ctx.step, "Executing tool");
        tool.execute(input, ctx).await
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Data/Transform (3) ──────────────────────────────────
        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::data::RegexReplaceTool);
        registry.register(crate::builtin::data::TextTemplateTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolInvoker for ToolRegistry {
    fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let tool = tool.to_string();
        Box::pin(async move {
            let output = self.execute(&tool, args, ctx).await?;
            if output.is_error {
                let message = match output.content {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(WeaveError::ToolInvocation { tool, message });
            }
            Ok(output.content)
        })
    }

    fn has_tool(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }
}
