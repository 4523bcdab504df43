use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// A named action a chain step can invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in `ToolStep::tool`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>>;
}

/// Resolves a tool by name and runs it.
///
/// Implementations must be safe to call concurrently from many steps.
pub trait ToolInvoker: Send + Sync + 'static {
    /// Invoke `tool` with `args`. A tool-reported error surfaces as `Err`.
    fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Whether `tool` can be resolved. Used to reject chains before running them.
    fn has_tool(&self, _tool: &str) -> bool {
        true
    }
}
