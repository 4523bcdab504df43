use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use weave_core::config::EngineConfig;
use weave_core::error::Result;
use weave_core::event::EventBus;
use weave_core::traits::ToolInvoker;
use weave_core::types::{EngineEvent, ExecutionMode, ToolChain, ToolResult, Vars};

use crate::aggregate::ResultAggregator;
use crate::executor::{run_parallel, run_pipeline, run_sequential, PipelineOutput, PipelineRun};
use crate::graph::{validate_chain, DependencyGraph};
use crate::runner::StepRunner;
use crate::scope::Scope;

/// Executes tool chains against an invoker.
///
/// Holds no per-execution state, so one engine can run many chains
/// concurrently. Each execution gets its own id, scope, slot pool and
/// aggregator.
pub struct ToolEngine {
    invoker: Arc<dyn ToolInvoker>,
    config: EngineConfig,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
    depth: usize,
}

impl ToolEngine {
    pub fn new(invoker: Arc<dyn ToolInvoker>, config: EngineConfig) -> Self {
        Self {
            invoker,
            config,
            events: None,
            cancel: CancellationToken::new(),
            depth: 0,
        }
    }

    /// Publish [`EngineEvent`]s for every execution on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Executions are cancelled when `token` is.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Nesting depth of composed tools this engine runs at.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check a chain without running it.
    pub fn validate(&self, chain: &ToolChain) -> Result<DependencyGraph> {
        validate_chain(chain, &Vars::new(), self.invoker.as_ref())
    }

    /// Check a chain that will be seeded with `vars`.
    pub fn validate_with(&self, chain: &ToolChain, vars: &Vars) -> Result<DependencyGraph> {
        validate_chain(chain, vars, self.invoker.as_ref())
    }

    pub async fn execute(&self, chain: &ToolChain) -> ToolResult {
        self.execute_with(chain, Vars::new()).await
    }

    /// Execute `chain` with `vars` as the initial data.
    ///
    /// Pipeline chains stream a single unit: `vars` as an object.
    pub async fn execute_with(&self, chain: &ToolChain, vars: Vars) -> ToolResult {
        let units = match chain.mode {
            ExecutionMode::Pipeline => vec![serde_json::Value::Object(vars.clone())],
            _ => Vec::new(),
        };
        self.run_chain(chain, chain.mode, vars, units).await.result
    }

    /// Start assembling a streaming run of `chain`, whatever its declared mode.
    pub fn pipeline<'a>(&'a self, chain: &'a ToolChain) -> PipelineRun<'a> {
        PipelineRun::new(self, chain)
    }

    pub(crate) async fn stream(
        &self,
        chain: &ToolChain,
        vars: Vars,
        units: Vec<serde_json::Value>,
    ) -> PipelineOutput {
        self.run_chain(chain, ExecutionMode::Pipeline, vars, units)
            .await
    }

    async fn run_chain(
        &self,
        chain: &ToolChain,
        mode: ExecutionMode,
        vars: Vars,
        units: Vec<serde_json::Value>,
    ) -> PipelineOutput {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();
        info!(
            execution_id = %execution_id,
            mode = ?mode,
            steps = chain.steps.len(),
            depth = self.depth,
            "Starting tool chain"
        );
        self.publish(EngineEvent::ChainStarted {
            execution_id: execution_id.clone(),
            mode,
            steps: chain.steps.len(),
        });

        let mut agg = ResultAggregator::new(vars.clone());
        let mut outputs = Vec::new();

        let checked = if mode == chain.mode {
            validate_chain(chain, &vars, self.invoker.as_ref())
        } else {
            let mut as_mode = chain.clone();
            as_mode.mode = mode;
            validate_chain(&as_mode, &vars, self.invoker.as_ref())
        };

        match checked {
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Chain rejected");
                agg.fail_chain(&e);
            }
            Ok(graph) => {
                let scope = Scope::new(
                    &self.cancel,
                    chain.timeout.or_else(|| self.config.default_timeout()),
                );
                let runner = StepRunner::new(
                    Arc::clone(&self.invoker),
                    execution_id.clone(),
                    chain,
                    &self.config,
                )
                .with_events(self.events.clone())
                .with_depth(self.depth);

                match mode {
                    ExecutionMode::Sequential => {
                        run_sequential(&runner, chain, &scope, &mut agg).await;
                    }
                    ExecutionMode::Parallel => {
                        run_parallel(
                            &runner,
                            chain,
                            &graph,
                            &scope,
                            self.config.max_concurrency,
                            &mut agg,
                        )
                        .await;
                    }
                    ExecutionMode::Pipeline => {
                        outputs = run_pipeline(
                            &runner,
                            chain,
                            &scope,
                            self.config.pipeline_buffer,
                            units,
                            &mut agg,
                        )
                        .await;
                    }
                }
                // Release anything still observing the chain token.
                scope.cancel();
            }
        }

        let result = agg.finish();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            execution_id = %execution_id,
            success = result.success,
            failed_steps = result.errors.len(),
            elapsed_ms,
            "Tool chain complete"
        );
        self.publish(EngineEvent::ChainCompleted {
            execution_id,
            success: result.success,
            elapsed_ms,
        });

        PipelineOutput { outputs, result }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
