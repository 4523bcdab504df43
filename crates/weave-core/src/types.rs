use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::traits::ToolInvoker;

/// Named values shared between steps (tool arguments, outputs, merged results).
pub type Vars = serde_json::Map<String, serde_json::Value>;

/// Reserved argument key under which a pipeline stage receives its unit.
pub const STREAM_DATA_KEY: &str = "stream_data";

/// How the steps of a chain are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Strictly in declared order.
    #[default]
    Sequential,
    /// Concurrently, as allowed by the dependency graph, through a bounded slot pool.
    Parallel,
    /// One stage per step; data units stream from stage to stage.
    Pipeline,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Abort the chain on the first failure.
    #[default]
    Stop,
    /// Record the failure and keep going.
    Continue,
    /// Retry the step locally, then keep going.
    Retry,
    /// Retry, then substitute the step's fallback.
    Fallback,
}

/// A declarative chain of tool invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolChain {
    #[serde(default)]
    pub steps: Vec<ToolStep>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Retries per step; engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::duration::option"
    )]
    pub retry_delay: Option<Duration>,
    /// Chain-wide deadline.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::duration::option"
    )]
    pub timeout: Option<Duration>,
}

impl ToolChain {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Append a step.
    pub fn step(mut self, step: ToolStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: Vec<ToolStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// Set the chain-wide retry budget and delay between attempts.
    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One tool invocation within a chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    /// Name of the tool to invoke.
    pub tool: String,
    #[serde(default)]
    pub args: Vars,
    /// Name under which the tool's result is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    /// Names of outputs this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_vars: Vec<String>,
    /// Expression evaluated against the aggregate before running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_strategy: Option<ErrorStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<ToolStep>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::duration::option"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Scheduling priority among ready steps (higher first).
    #[serde(default)]
    pub weight: i32,
}

impl ToolStep {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ..Self::default()
        }
    }

    /// Set the arguments. Non-object values are ignored.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = args {
            self.args = map;
        }
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_var = Some(name.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_vars = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = Some(strategy);
        self
    }

    pub fn with_fallback(mut self, fallback: ToolStep) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}

/// A step-level failure reported in a [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: usize,
    pub tool: String,
    pub message: String,
}

/// Per-step execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub used_fallback: bool,
    pub retries: u32,
    pub elapsed_ms: u64,
}

/// Outcome of executing a chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    /// Merged outputs of all steps.
    #[serde(default)]
    pub data: Vars,
    /// First terminal failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSummary>,
}

impl ToolResult {
    pub fn success(data: Vars) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// What a tool returns from a single execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<serde_json::Value>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Tool definition for listing and discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Identifier of the chain execution that issued the call.
    pub execution_id: String,
    /// Index of the calling step, if any.
    pub step: Option<usize>,
    /// Cancelled when the step or the chain is aborted or times out.
    pub cancel: CancellationToken,
    /// Invoker that issued the call, for tools that call other tools.
    pub invoker: Option<Arc<dyn ToolInvoker>>,
    /// Nesting depth of composed tools (0 for a top-level chain).
    pub depth: usize,
    /// Limits of the engine that issued the call.
    pub config: Option<Arc<EngineConfig>>,
}

impl ToolContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            step: None,
            cancel: CancellationToken::new(),
            invoker: None,
            depth: 0,
            config: None,
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("execution_id", &self.execution_id)
            .field("step", &self.step)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("invoker", &self.invoker.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Chain execution started.
    ChainStarted {
        execution_id: String,
        mode: ExecutionMode,
        steps: usize,
    },
    /// A step attempt started.
    StepStarted {
        execution_id: String,
        index: usize,
        tool: String,
        attempt: u32,
    },
    /// A failed attempt will be retried after a delay.
    StepRetrying {
        execution_id: String,
        index: usize,
        attempt: u32,
        error: String,
    },
    /// Retries exhausted; the fallback step is about to run.
    StepFallback {
        execution_id: String,
        index: usize,
        fallback: String,
    },
    /// The step's condition evaluated false.
    StepSkipped { execution_id: String, index: usize },
    /// A step reached a terminal outcome.
    StepCompleted {
        execution_id: String,
        index: usize,
        success: bool,
        elapsed_ms: u64,
    },
    /// Chain execution finished.
    ChainCompleted {
        execution_id: String,
        success: bool,
        elapsed_ms: u64,
    },
}
