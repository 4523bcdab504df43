use std::collections::HashSet;

use weave_core::error::WeaveError;
use weave_core::types::{StepFailure, StepSummary, ToolResult, Vars};

use crate::runner::StepResult;

/// Merges step results into the chain's data.
///
/// Owned by exactly one executor loop; concurrent steps hand their results
/// back to that loop instead of writing here themselves. Later writes to a
/// name replace earlier ones.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    data: Vars,
    satisfied: HashSet<usize>,
    failed: HashSet<usize>,
    errors: Vec<StepFailure>,
    summaries: Vec<StepSummary>,
    first_error: Option<String>,
    first_error_is_cancel: bool,
    aborted: bool,
}

impl ResultAggregator {
    /// Start from the seed variables supplied by the caller.
    pub fn new(seed: Vars) -> Self {
        Self {
            data: seed,
            ..Self::default()
        }
    }

    /// Record a finished (or skipped) step.
    pub fn record(&mut self, result: StepResult) {
        self.summaries.push(result.summary());
        match result.error {
            None => {
                self.satisfied.insert(result.index);
                self.merge(result.data);
            }
            Some(e) => {
                self.failed.insert(result.index);
                self.record_failure(result.index, &result.tool, &e);
            }
        }
    }

    /// Record a step-level failure without a summary.
    pub fn record_failure(&mut self, step: usize, tool: &str, error: &WeaveError) {
        self.note_error(error);
        self.errors.push(StepFailure {
            step,
            tool: tool.to_string(),
            message: error.to_string(),
        });
    }

    pub fn record_summary(&mut self, summary: StepSummary) {
        self.summaries.push(summary);
    }

    /// Fail the chain as a whole: validation errors, timeouts before a step started.
    pub fn fail_chain(&mut self, error: &WeaveError) {
        self.aborted = true;
        self.note_error(error);
    }

    pub fn merge(&mut self, data: Vars) {
        self.data.extend(data);
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.data.insert(name.into(), value);
    }

    pub fn is_satisfied(&self, step: usize) -> bool {
        self.satisfied.contains(&step)
    }

    pub fn has_failed(&self, step: usize) -> bool {
        self.failed.contains(&step)
    }

    pub fn data(&self) -> &Vars {
        &self.data
    }

    /// Copy of the current data, handed to a step about to start.
    pub fn snapshot(&self) -> Vars {
        self.data.clone()
    }

    pub fn finish(mut self) -> ToolResult {
        self.summaries.sort_by_key(|s| s.step);
        self.errors.sort_by_key(|f| f.step);
        ToolResult {
            success: self.errors.is_empty() && !self.aborted,
            data: self.data,
            error: self.first_error,
            errors: self.errors,
            steps: self.summaries,
        }
    }

    /// Keep the first failure; a cancellation caused by that failure never displaces it.
    fn note_error(&mut self, error: &WeaveError) {
        let is_cancel = matches!(error, WeaveError::Cancelled);
        if self.first_error.is_none() || (self.first_error_is_cancel && !is_cancel) {
            self.first_error = Some(error.to_string());
            self.first_error_is_cancel = is_cancel;
        }
    }
}
