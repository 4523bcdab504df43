use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use weave_core::config::{ComposedToolConfig, EngineConfig};
use weave_core::error::{Result, WeaveError};
use weave_core::traits::Tool;
use weave_core::types::{ToolChain, ToolContext, ToolOutput, Vars};

use crate::engine::ToolEngine;

/// A chain registered under a name and invoked like any other tool.
///
/// The tool's arguments seed the chain's variables; the chain's merged data
/// is the tool's output. Runs on the invoker that called it, one level
/// deeper, and refuses to nest past `max_composition_depth`.
///
/// Without an explicit config the nested chain runs under the limits of the
/// engine that invoked the tool.
pub struct ComposedTool {
    name: String,
    description: String,
    chain: ToolChain,
    config: Option<EngineConfig>,
}

impl ComposedTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, chain: ToolChain) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            chain,
            config: None,
        }
    }

    /// Fixed engine limits for the nested chain, whoever invokes it.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn from_config(def: &ComposedToolConfig, config: &EngineConfig) -> Self {
        Self::new(&def.name, &def.description, def.chain.clone()).with_config(config.clone())
    }

    pub fn chain(&self) -> &ToolChain {
        &self.chain
    }
}

impl Tool for ComposedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        // Every input no step produces must come from the caller.
        let produced: Vec<&str> = self
            .chain
            .steps
            .iter()
            .filter_map(|s| s.output_var.as_deref())
            .collect();
        let mut required: Vec<&str> = self
            .chain
            .steps
            .iter()
            .flat_map(|s| s.input_vars.iter().map(String::as_str))
            .filter(|v| !produced.contains(v))
            .collect();
        required.sort_unstable();
        required.dedup();

        serde_json::json!({
            "type": "object",
            "required": required,
            "additionalProperties": true
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let invoker = ctx.invoker.clone().ok_or_else(|| WeaveError::ToolInvocation {
                tool: self.name.clone(),
                message: "composed tools must be invoked by an engine".into(),
            })?;
            let config = match (&self.config, &ctx.config) {
                (Some(own), _) => own.clone(),
                (None, Some(caller)) => EngineConfig::clone(caller),
                (None, None) => EngineConfig::default(),
            };
            if ctx.depth >= config.max_composition_depth {
                return Err(WeaveError::CompositionDepth {
                    tool: self.name.clone(),
                    depth: config.max_composition_depth,
                });
            }

            let vars: Vars = match input {
                serde_json::Value::Object(map) => map,
                serde_json::Value::Null => Vars::new(),
                other => {
                    return Err(WeaveError::ToolValidation(format!(
                        "{} expects an object of variables, got {}",
                        self.name, other
                    )))
                }
            };

            debug!(tool = %self.name, depth = ctx.depth + 1, "Running composed chain");
            let engine = ToolEngine::new(Arc::clone(&invoker), config)
                .with_cancellation(ctx.cancel.clone())
                .with_depth(ctx.depth + 1);
            let result = engine.execute_with(&self.chain, vars).await;

            if result.success {
                Ok(ToolOutput::success(serde_json::Value::Object(result.data)))
            } else {
                Ok(ToolOutput::error(
                    result
                        .error
                        .unwrap_or_else(|| format!("composed chain {} failed", self.name)),
                ))
            }
        })
    }
}
