use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaveError};
use crate::types::ToolChain;

/// Top-level weave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Chains registered as invocable tools at startup.
    #[serde(default)]
    pub composed: Vec<ComposedToolConfig>,
}

/// Execution limits and chain defaults, injected into each engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Slots in the bounded-parallel pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Capacity of each pipeline stage queue.
    #[serde(default = "default_pipeline_buffer")]
    pub pipeline_buffer: usize,
    /// How deep composed tools may nest.
    #[serde(default = "default_max_composition_depth")]
    pub max_composition_depth: usize,
    /// Retries when neither the chain nor the step sets one.
    #[serde(default)]
    pub default_max_retries: u32,
    #[serde(default)]
    pub default_retry_delay_ms: u64,
    /// Chain deadline when the chain sets none.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            pipeline_buffer: default_pipeline_buffer(),
            max_composition_depth: default_max_composition_depth(),
            default_max_retries: 0,
            default_retry_delay_ms: 0,
            default_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Set the parallel slot pool size.
    pub fn with_max_concurrency(mut self, slots: usize) -> Self {
        self.max_concurrency = slots;
        self
    }
}

fn default_max_concurrency() -> usize { 10 }
fn default_pipeline_buffer() -> usize { 16 }
fn default_max_composition_depth() -> usize { 8 }

/// Runtime logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `"weave=debug"`.
    #[serde(default)]
    pub level: Option<String>,
}

/// A chain exposed as a named tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub chain: ToolChain,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(WeaveError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.pipeline_buffer == 0 {
            return Err(WeaveError::Config(
                "engine.pipeline_buffer must be at least 1".into(),
            ));
        }
        for (i, composed) in self.composed.iter().enumerate() {
            if composed.name.trim().is_empty() {
                return Err(WeaveError::Config(format!(
                    "composed tool #{} has an empty name",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Load a chain definition. `.json` files are read as JSON, anything else as TOML.
pub fn load_chain(path: &Path) -> Result<ToolChain> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;
    let expanded = expand_env_vars(&content);

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        Ok(serde_json::from_str(&expanded)?)
    } else {
        toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    tracing::warn!(var = %var_name, "Environment variable not set, leaving placeholder");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionMode;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEAVE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEAVE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEAVE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEAVE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEAVE_VAR}\"");
    }

    #[test]
    fn test_plain_dollar_args_untouched() {
        let result = expand_env_vars(r#"data = "$content""#);
        assert_eq!(result, r#"data = "$content""#);
    }

    #[test]
    fn test_engine_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 10);
        assert_eq!(config.engine.pipeline_buffer, 16);
        assert_eq!(config.engine.max_composition_depth, 8);
        assert_eq!(config.engine.default_max_retries, 0);
        assert!(config.engine.default_timeout().is_none());
        assert!(config.log.level.is_none());
        assert!(config.composed.is_empty());
    }

    #[test]
    fn test_composed_tool_section() {
        let toml_str = r#"
[engine]
max_concurrency = 4

[[composed]]
name = "scrape"
description = "Fetch and store"

[composed.chain]
mode = "parallel"
error_strategy = "fallback"
retry_delay = "100ms"

[[composed.chain.steps]]
tool = "fetch"
output_var = "page"

[[composed.chain.steps]]
tool = "store"
input_vars = ["page"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.composed.len(), 1);
        let chain = &config.composed[0].chain;
        assert_eq!(chain.mode, ExecutionMode::Parallel);
        assert_eq!(chain.retry_delay, Some(Duration::from_millis(100)));
        assert_eq!(chain.steps[1].input_vars, vec!["page"]);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = AppConfig {
            engine: EngineConfig::default().with_max_concurrency(0),
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(WeaveError::Config(_))));
    }
}
