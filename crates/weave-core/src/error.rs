use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaveError {
    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Chain validation errors
    #[error("Dependency cycle between steps: {cycle}")]
    DependencyCycle { cycle: String },

    #[error("Step {step} requires '{input}' but no step or seed variable provides it")]
    DependencyUnsatisfied { step: usize, input: String },

    #[error("Output '{name}' is produced by both step {first} and step {second}")]
    DuplicateOutput {
        name: String,
        first: usize,
        second: usize,
    },

    #[error("Fallback of step {step} declares its own fallback (depth is limited to 1)")]
    FallbackTooDeep { step: usize },

    #[error("Fallback of step {step} writes '{name}' but may only write its primary's output")]
    FallbackOutput { step: usize, name: String },

    // Recovery errors
    #[error("Retries exhausted after {attempts} attempts: {tool}: {message}")]
    RetryExhausted {
        tool: String,
        attempts: u32,
        message: String,
    },

    #[error("Fallback '{fallback}' for {tool} also failed: {message}")]
    FallbackExhausted {
        tool: String,
        fallback: String,
        message: String,
    },

    // Execution errors
    #[error("Chain timeout after {timeout_ms}ms")]
    ChainTimeout { timeout_ms: u64 },

    #[error("Chain cancelled")]
    Cancelled,

    #[error("Composed tool {tool} exceeded nesting depth {depth}")]
    CompositionDepth { tool: String, depth: usize },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaveError {
    /// Whether a step that failed with this error may be attempted again.
    ///
    /// Only failures local to one attempt are retryable. Chain-wide
    /// termination (timeout, cancellation) and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WeaveError::ToolInvocation { .. }
                | WeaveError::ToolTimeout { .. }
                | WeaveError::ToolValidation(_)
                | WeaveError::Json(_)
                | WeaveError::Io(_)
        )
    }

    /// Whether this error ends the whole chain regardless of strategy.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WeaveError::ChainTimeout { .. } | WeaveError::Cancelled
        )
    }

    /// Whether this error is raised while validating a chain, before any tool runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WeaveError::DependencyCycle { .. }
                | WeaveError::DependencyUnsatisfied { .. }
                | WeaveError::DuplicateOutput { .. }
                | WeaveError::FallbackTooDeep { .. }
                | WeaveError::FallbackOutput { .. }
                | WeaveError::ToolNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let invocation = WeaveError::ToolInvocation {
            tool: "fetch".into(),
            message: "503".into(),
        };
        let timeout = WeaveError::ToolTimeout {
            tool: "fetch".into(),
            timeout_ms: 10,
        };
        assert!(invocation.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!WeaveError::Cancelled.is_retryable());
        assert!(!WeaveError::ChainTimeout { timeout_ms: 5 }.is_retryable());
        assert!(!WeaveError::ToolNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_terminal_and_validation() {
        assert!(WeaveError::Cancelled.is_terminal());
        assert!(!WeaveError::Cancelled.is_validation());
        let cycle = WeaveError::DependencyCycle {
            cycle: "0 -> 1 -> 0".into(),
        };
        assert!(cycle.is_validation());
        assert_eq!(cycle.to_string(), "Dependency cycle between steps: 0 -> 1 -> 0");
    }
}
