use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use weave_core::config::EngineConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::traits::ToolInvoker;
use weave_core::types::{
    EngineEvent, ErrorStrategy, StepSummary, ToolChain, ToolContext, ToolStep, Vars,
};

use crate::condition::evaluate_condition;
use crate::scope::{Interrupt, Scope};

/// Effective recovery settings for one step.
///
/// Step settings win over chain settings, which win over engine defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
}

/// Outcome of running one step, including retries and fallback.
#[derive(Debug)]
pub struct StepResult {
    pub index: usize,
    pub tool: String,
    /// Raw value returned by the tool that succeeded (primary or fallback).
    pub output: Option<serde_json::Value>,
    /// Entries this step contributes to the chain data.
    pub data: Vars,
    pub error: Option<WeaveError>,
    pub retries: u32,
    pub elapsed: Duration,
    pub skipped: bool,
    pub used_fallback: bool,
}

impl StepResult {
    fn skipped(index: usize, tool: &str) -> Self {
        Self {
            index,
            tool: tool.to_string(),
            output: None,
            data: Vars::new(),
            error: None,
            retries: 0,
            elapsed: Duration::ZERO,
            skipped: true,
            used_fallback: false,
        }
    }

    /// Succeeded or was skipped by its condition.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.error.as_ref().is_some_and(WeaveError::is_terminal)
    }

    pub fn summary(&self) -> StepSummary {
        StepSummary {
            step: self.index,
            tool: self.tool.clone(),
            success: self.succeeded(),
            skipped: self.skipped,
            used_fallback: self.used_fallback,
            retries: self.retries,
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Runs single steps for one chain execution.
///
/// Cheap to clone; parallel and pipeline executors hand a clone to each task.
#[derive(Clone)]
pub struct StepRunner {
    invoker: Arc<dyn ToolInvoker>,
    config: Arc<EngineConfig>,
    events: Option<Arc<EventBus>>,
    execution_id: String,
    depth: usize,
    strategy: ErrorStrategy,
    max_retries: u32,
    retry_delay: Duration,
}

impl StepRunner {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        execution_id: impl Into<String>,
        chain: &ToolChain,
        config: &EngineConfig,
    ) -> Self {
        Self {
            invoker,
            config: Arc::new(config.clone()),
            events: None,
            execution_id: execution_id.into(),
            depth: 0,
            strategy: chain.error_strategy,
            max_retries: chain.max_retries.unwrap_or(config.default_max_retries),
            retry_delay: chain.retry_delay.unwrap_or_else(|| config.default_retry_delay()),
        }
    }

    pub fn with_events(mut self, events: Option<Arc<EventBus>>) -> Self {
        self.events = events;
        self
    }

    /// Composition depth reported to tools through their context.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn policy(&self, step: &ToolStep) -> StepPolicy {
        StepPolicy {
            strategy: step.error_strategy.unwrap_or(self.strategy),
            max_retries: step.max_retries.unwrap_or(self.max_retries),
            retry_delay: self.retry_delay,
            timeout: step.timeout,
        }
    }

    /// Whether a failure of `step` aborts the chain.
    pub fn stops_chain(&self, step: &ToolStep, result: &StepResult) -> bool {
        !result.succeeded()
            && (result.is_terminal() || self.policy(step).strategy == ErrorStrategy::Stop)
    }

    /// The error reported when `scope` ends before work completes.
    pub fn interrupted(&self, scope: &Scope) -> WeaveError {
        if scope.is_expired() {
            WeaveError::ChainTimeout {
                timeout_ms: scope.timeout().map_or(0, |t| t.as_millis() as u64),
            }
        } else {
            WeaveError::Cancelled
        }
    }

    /// Run `step` against the chain data visible to it.
    ///
    /// Evaluates the condition, then makes up to `max_retries + 1` attempts
    /// and, under the fallback strategy, one run of the fallback step.
    pub async fn run(&self, index: usize, step: &ToolStep, state: &Vars, scope: &Scope) -> StepResult {
        let start = Instant::now();

        if let Some(expr) = &step.condition {
            if !evaluate_condition(expr, state) {
                debug!(execution_id = %self.execution_id, step = index, condition = %expr, "Condition false, skipping step");
                self.publish(EngineEvent::StepSkipped {
                    execution_id: self.execution_id.clone(),
                    index,
                });
                return StepResult::skipped(index, &step.tool);
            }
        }

        let policy = self.policy(step);
        let (outcome, mut retries) = self.attempt(index, step, &policy, state, scope).await;

        let mut used_fallback = false;
        let outcome = match (outcome, step.fallback.as_deref()) {
            (Err(e), Some(fallback))
                if policy.strategy == ErrorStrategy::Fallback && !e.is_terminal() =>
            {
                info!(
                    execution_id = %self.execution_id,
                    step = index,
                    tool = %step.tool,
                    fallback = %fallback.tool,
                    error = %e,
                    "Primary tool exhausted, running fallback"
                );
                self.publish(EngineEvent::StepFallback {
                    execution_id: self.execution_id.clone(),
                    index,
                    fallback: fallback.tool.clone(),
                });

                used_fallback = true;
                let fb_policy = self.policy(fallback);
                let (fb_outcome, fb_retries) =
                    self.attempt(index, fallback, &fb_policy, state, scope).await;
                retries += fb_retries;
                fb_outcome.map_err(|fe| match fe {
                    fe if fe.is_terminal() => fe,
                    fe => WeaveError::FallbackExhausted {
                        tool: step.tool.clone(),
                        fallback: fallback.tool.clone(),
                        message: fe.to_string(),
                    },
                })
            }
            (outcome, _) => outcome,
        };

        let elapsed = start.elapsed();
        let (output, data, error) = match outcome {
            Ok(value) => {
                let data = step_data(step.output_var.as_deref(), &value);
                (Some(value), data, None)
            }
            Err(e) => {
                error!(
                    execution_id = %self.execution_id,
                    step = index,
                    tool = %step.tool,
                    error = %e,
                    "Step failed"
                );
                (None, Vars::new(), Some(e))
            }
        };

        debug!(
            execution_id = %self.execution_id,
            step = index,
            succeeded = error.is_none(),
            retries,
            elapsed_ms = elapsed.as_millis() as u64,
            "Step execution complete"
        );
        self.publish(EngineEvent::StepCompleted {
            execution_id: self.execution_id.clone(),
            index,
            success: error.is_none(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        StepResult {
            index,
            tool: step.tool.clone(),
            output,
            data,
            error,
            retries,
            elapsed,
            skipped: false,
            used_fallback,
        }
    }

    /// Invoke `step.tool` until it succeeds, fails permanently or the budget runs out.
    /// Returns the outcome and the number of retries consumed.
    async fn attempt(
        &self,
        index: usize,
        step: &ToolStep,
        policy: &StepPolicy,
        state: &Vars,
        scope: &Scope,
    ) -> (Result<serde_json::Value>, u32) {
        let mut attempt: u32 = 0;
        loop {
            if scope.is_done() {
                return (Err(self.interrupted(scope)), attempt);
            }

            self.publish(EngineEvent::StepStarted {
                execution_id: self.execution_id.clone(),
                index,
                tool: step.tool.clone(),
                attempt,
            });
            debug!(execution_id = %self.execution_id, step = index, tool = %step.tool, attempt, "Invoking tool");

            let attempt_scope = scope.child(policy.timeout);
            let ctx = ToolContext {
                execution_id: self.execution_id.clone(),
                step: Some(index),
                cancel: attempt_scope.token().clone(),
                invoker: Some(Arc::clone(&self.invoker)),
                depth: self.depth,
                config: Some(Arc::clone(&self.config)),
            };
            // The invoker is called inside the guarded future so a panic while
            // building the call is caught as well.
            let call: futures::future::BoxFuture<'_, Result<serde_json::Value>> = AssertUnwindSafe(async move {
                self.invoker.invoke(&step.tool, build_args(step, state), ctx).await
            })
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|_| {
                    error!(execution_id = %self.execution_id, step = index, tool = %step.tool, "Tool panicked");
                    Err(WeaveError::ToolInvocation {
                        tool: step.tool.clone(),
                        message: "step panicked".into(),
                    })
                })
            })
            .boxed();

            let err = match attempt_scope.run(call).await {
                Ok(Ok(value)) => return (Ok(value), attempt),
                _ if scope.is_done() => self.interrupted(scope),
                Ok(Err(e)) => e,
                Err(Interrupt::Deadline) => WeaveError::ToolTimeout {
                    tool: step.tool.clone(),
                    timeout_ms: policy.timeout.map_or(0, |t| t.as_millis() as u64),
                },
                Err(Interrupt::Cancelled) => WeaveError::Cancelled,
            };

            if !err.is_retryable() {
                return (Err(err), attempt);
            }
            if attempt >= policy.max_retries {
                if attempt == 0 {
                    return (Err(err), 0);
                }
                return (
                    Err(WeaveError::RetryExhausted {
                        tool: step.tool.clone(),
                        attempts: attempt + 1,
                        message: err.to_string(),
                    }),
                    attempt,
                );
            }

            warn!(
                execution_id = %self.execution_id,
                step = index,
                tool = %step.tool,
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = policy.retry_delay.as_millis() as u64,
                error = %err,
                "Retrying step"
            );
            self.publish(EngineEvent::StepRetrying {
                execution_id: self.execution_id.clone(),
                index,
                attempt: attempt + 1,
                error: err.to_string(),
            });

            if scope.sleep(policy.retry_delay).await.is_err() {
                return (Err(self.interrupted(scope)), attempt);
            }
            attempt += 1;
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Arguments for one invocation of `step`.
///
/// String arguments of the form `$name` are replaced by the chain value
/// `name` (recursively through arrays and objects). Each input variable is
/// then passed under its own name unless an explicit argument already uses it.
pub fn build_args(step: &ToolStep, state: &Vars) -> serde_json::Value {
    let mut args = step.args.clone();
    for value in args.values_mut() {
        interpolate(value, state);
    }
    for name in &step.input_vars {
        if let Some(value) = state.get(name) {
            args.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
    serde_json::Value::Object(args)
}

fn interpolate(value: &mut serde_json::Value, state: &Vars) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(found) = s.strip_prefix('$').and_then(|name| state.get(name)) {
                *value = found.clone();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                interpolate(item, state);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                interpolate(item, state);
            }
        }
        _ => {}
    }
}

/// What a successful value contributes to the chain data: the value under
/// `output_var`, or an object's entries when no output variable is set.
pub fn step_data(output_var: Option<&str>, value: &serde_json::Value) -> Vars {
    let mut data = Vars::new();
    match (output_var, value) {
        (Some(name), value) => {
            data.insert(name.to_string(), value.clone());
        }
        (None, serde_json::Value::Object(map)) => data.clone_from(map),
        (None, _) => {}
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use weave_test_utils::{FnTool, ScriptedTool};
    use weave_tools::ToolRegistry;

    fn runner(registry: ToolRegistry, chain: &ToolChain) -> StepRunner {
        StepRunner::new(Arc::new(registry), "exec-1", chain, &EngineConfig::default())
    }

    fn root_scope() -> Scope {
        Scope::new(&CancellationToken::new(), None)
    }

    #[test]
    fn test_build_args_interpolates_and_merges_inputs() {
        let step = ToolStep::new("memory")
            .with_args(serde_json::json!({
                "data": "$content",
                "nested": {"list": ["$url", "plain"]},
                "url": "explicit",
                "missing": "$nope"
            }))
            .with_inputs(["content", "url"]);
        let mut state = Vars::new();
        state.insert("content".into(), serde_json::json!({"title": "T"}));
        state.insert("url".into(), serde_json::json!("https://example.com"));

        let args = build_args(&step, &state);
        assert_eq!(args["data"], serde_json::json!({"title": "T"}));
        assert_eq!(args["nested"]["list"][0], "https://example.com");
        assert_eq!(args["nested"]["list"][1], "plain");
        assert_eq!(args["url"], "explicit");
        assert_eq!(args["content"], serde_json::json!({"title": "T"}));
        assert_eq!(args["missing"], "$nope");
    }

    #[test]
    fn test_step_data_shapes() {
        let obj = serde_json::json!({"a": 1});
        assert_eq!(step_data(Some("out"), &obj)["out"], obj);
        assert_eq!(step_data(None, &obj)["a"], 1);
        assert!(step_data(None, &serde_json::json!("text")).is_empty());
    }

    #[test]
    fn test_policy_precedence() {
        let chain = ToolChain::default()
            .with_error_strategy(ErrorStrategy::Continue)
            .with_retries(2, Duration::from_millis(7));
        let runner = runner(ToolRegistry::new(), &chain);

        let plain = runner.policy(&ToolStep::new("a"));
        assert_eq!(plain.strategy, ErrorStrategy::Continue);
        assert_eq!(plain.max_retries, 2);
        assert_eq!(plain.retry_delay, Duration::from_millis(7));

        let overridden = runner.policy(
            &ToolStep::new("a")
                .with_error_strategy(ErrorStrategy::Fallback)
                .with_retries(5),
        );
        assert_eq!(overridden.strategy, ErrorStrategy::Fallback);
        assert_eq!(overridden.max_retries, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let flaky = ScriptedTool::new("flaky")
            .failing_times(2)
            .returning(serde_json::json!("ok"));
        let mut registry = ToolRegistry::new();
        registry.register(flaky.clone());
        let chain = ToolChain::default().with_retries(3, Duration::from_millis(5));

        let result = runner(registry, &chain)
            .run(0, &ToolStep::new("flaky").with_output("out"), &Vars::new(), &root_scope())
            .await;

        assert!(result.succeeded());
        assert_eq!(result.retries, 2);
        assert_eq!(result.data["out"], "ok");
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_counts_attempts() {
        let broken = ScriptedTool::new("broken").failing();
        let mut registry = ToolRegistry::new();
        registry.register(broken.clone());
        let chain = ToolChain::default().with_retries(2, Duration::from_millis(1));

        let result = runner(registry, &chain)
            .run(0, &ToolStep::new("broken"), &Vars::new(), &root_scope())
            .await;

        assert!(matches!(result.error, Some(WeaveError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(broken.calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_not_retried() {
        let chain = ToolChain::default().with_retries(3, Duration::ZERO);
        let result = runner(ToolRegistry::new(), &chain)
            .run(0, &ToolStep::new("ghost"), &Vars::new(), &root_scope())
            .await;
        assert!(matches!(result.error, Some(WeaveError::ToolNotFound(_))));
        assert_eq!(result.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let slow = ScriptedTool::new("slow").with_delay(Duration::from_millis(50));
        let mut registry = ToolRegistry::new();
        registry.register(slow);
        let chain = ToolChain::default();

        let step = ToolStep::new("slow").with_timeout(Duration::from_millis(10));
        let result = runner(registry, &chain)
            .run(0, &step, &Vars::new(), &root_scope())
            .await;
        assert!(matches!(
            result.error,
            Some(WeaveError::ToolTimeout { timeout_ms: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_fallback_output_lands_under_primary_var() {
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedTool::new("primary").failing());
        registry.register(ScriptedTool::new("backup").returning(serde_json::json!("plan b")));
        let chain = ToolChain::default().with_error_strategy(ErrorStrategy::Fallback);

        let step = ToolStep::new("primary")
            .with_output("answer")
            .with_fallback(ToolStep::new("backup"));
        let result = runner(registry, &chain)
            .run(0, &step, &Vars::new(), &root_scope())
            .await;

        assert!(result.succeeded());
        assert!(result.used_fallback);
        assert_eq!(result.data["answer"], "plan b");
    }

    #[tokio::test]
    async fn test_fallback_ignored_under_continue() {
        let backup = ScriptedTool::new("backup");
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedTool::new("primary").failing());
        registry.register(backup.clone());
        let chain = ToolChain::default().with_error_strategy(ErrorStrategy::Continue);

        let step = ToolStep::new("primary").with_fallback(ToolStep::new("backup"));
        let result = runner(registry, &chain)
            .run(0, &step, &Vars::new(), &root_scope())
            .await;

        assert!(!result.succeeded());
        assert_eq!(backup.calls(), 0);
    }

    #[tokio::test]
    async fn test_condition_false_skips() {
        let tool = ScriptedTool::new("gated");
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        let chain = ToolChain::default();

        let step = ToolStep::new("gated").with_condition(r#"status == "ready""#);
        let result = runner(registry, &chain)
            .run(0, &step, &Vars::new(), &root_scope())
            .await;

        assert!(result.skipped);
        assert!(result.succeeded());
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_tool_becomes_step_error() {
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::new("boom", |_| panic!("boom")));
        let chain = ToolChain::default().with_retries(1, Duration::ZERO);

        let result = runner(registry, &chain)
            .run(0, &ToolStep::new("boom"), &Vars::new(), &root_scope())
            .await;

        match result.error {
            Some(WeaveError::RetryExhausted { attempts, message, .. }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("step panicked"), "{}", message);
            }
            other => panic!("expected retry exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_scope_reports_cancelled() {
        let tool = ScriptedTool::new("idle");
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        let scope = root_scope();
        scope.cancel();

        let result = runner(registry, &ToolChain::default())
            .run(0, &ToolStep::new("idle"), &Vars::new(), &scope)
            .await;
        assert!(matches!(result.error, Some(WeaveError::Cancelled)));
        assert_eq!(tool.calls(), 0);
    }
}
