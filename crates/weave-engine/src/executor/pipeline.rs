use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use weave_core::error::WeaveError;
use weave_core::types::{StepSummary, ToolChain, ToolResult, ToolStep, Vars, STREAM_DATA_KEY};

use crate::aggregate::ResultAggregator;
use crate::engine::ToolEngine;
use crate::runner::StepRunner;
use crate::scope::Scope;

/// Key under which pipeline outputs are recorded when the last step names none.
pub const OUTPUTS_KEY: &str = "outputs";

/// What a streaming run produced.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// Units that left the last stage, in the order they were fed.
    pub outputs: Vec<serde_json::Value>,
    pub result: ToolResult,
}

/// A pipeline execution being assembled: seed variables and the units to stream.
///
/// ```ignore
/// let out = engine.pipeline(&chain).feed(pages).run().await;
/// ```
pub struct PipelineRun<'a> {
    engine: &'a ToolEngine,
    chain: &'a ToolChain,
    vars: Vars,
    units: Vec<serde_json::Value>,
}

impl<'a> PipelineRun<'a> {
    pub(crate) fn new(engine: &'a ToolEngine, chain: &'a ToolChain) -> Self {
        Self {
            engine,
            chain,
            vars: Vars::new(),
            units: Vec::new(),
        }
    }

    /// Variables visible to every stage, alongside the fields of each unit.
    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars = vars;
        self
    }

    /// Queue units for the first stage. May be called more than once.
    pub fn feed<I>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        self.units.extend(units);
        self
    }

    pub async fn run(self) -> PipelineOutput {
        self.engine
            .stream(self.chain, self.vars, self.units)
            .await
    }
}

/// Stream `units` through one stage per step, connected by bounded queues.
///
/// Each stage handles units one at a time in arrival order, so outputs keep
/// feed order. A stage receives its unit under `stream_data` (and can read
/// the unit's fields as variables); its tool's return value becomes the
/// unit passed downstream. A unit whose step fails is dropped and the
/// failure recorded; under `Stop` the whole pipeline is cancelled.
pub async fn run_pipeline(
    runner: &StepRunner,
    chain: &ToolChain,
    scope: &Scope,
    buffer: usize,
    units: Vec<serde_json::Value>,
    agg: &mut ResultAggregator,
) -> Vec<serde_json::Value> {
    let buffer = buffer.max(1);
    let seed = agg.snapshot();

    let (feed_tx, mut inbound) = mpsc::channel(buffer);
    let mut stages: Vec<JoinHandle<StageReport>> = Vec::with_capacity(chain.steps.len());
    for (index, step) in chain.steps.iter().enumerate() {
        let (tx, rx) = mpsc::channel(buffer);
        let stage = Stage::new(index, step, runner.clone(), scope.clone(), seed.clone());
        stages.push(tokio::spawn(stage.run(inbound, tx)));
        inbound = rx;
    }

    let feeder_scope = scope.clone();
    let feeder = tokio::spawn(async move {
        for unit in units {
            tokio::select! {
                biased;
                _ = feeder_scope.done() => break,
                sent = feed_tx.send(unit) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut outputs = Vec::new();
    while let Some(unit) = inbound.recv().await {
        outputs.push(unit);
    }

    if let Err(e) = feeder.await {
        warn!(execution_id = %runner.execution_id(), error = %e, "Pipeline feeder failed");
    }
    for (index, handle) in stages.into_iter().enumerate() {
        match handle.await {
            Ok(report) => report.record(agg),
            Err(e) => {
                error!(execution_id = %runner.execution_id(), stage = index, error = %e, "Pipeline stage failed");
                agg.record_failure(
                    index,
                    &chain.steps[index].tool,
                    &WeaveError::ToolInvocation {
                        tool: chain.steps[index].tool.clone(),
                        message: format!("stage task failed: {}", e),
                    },
                );
            }
        }
    }

    if scope.is_done() {
        agg.fail_chain(&runner.interrupted(scope));
    }

    let key = chain
        .steps
        .last()
        .and_then(|s| s.output_var.clone())
        .unwrap_or_else(|| OUTPUTS_KEY.to_string());
    agg.insert(key, serde_json::Value::Array(outputs.clone()));
    outputs
}

struct Stage {
    index: usize,
    step: ToolStep,
    runner: StepRunner,
    scope: Scope,
    seed: Vars,
}

impl Stage {
    fn new(index: usize, step: &ToolStep, runner: StepRunner, scope: Scope, seed: Vars) -> Self {
        let mut step = step.clone();
        if !step.input_vars.iter().any(|v| v == STREAM_DATA_KEY) {
            step.input_vars.push(STREAM_DATA_KEY.to_string());
        }
        Self {
            index,
            step,
            runner,
            scope,
            seed,
        }
    }

    /// Process units until the inbound queue closes or the scope ends.
    /// Dropping `tx` on return closes the next stage's queue.
    async fn run(
        self,
        mut rx: mpsc::Receiver<serde_json::Value>,
        tx: mpsc::Sender<serde_json::Value>,
    ) -> StageReport {
        let mut report = StageReport::new(self.index, &self.step.tool);

        loop {
            let unit = tokio::select! {
                biased;
                _ = self.scope.done() => break,
                unit = rx.recv() => match unit {
                    Some(unit) => unit,
                    None => break,
                },
            };

            let state = self.unit_state(&unit);
            let result = self.runner.run(self.index, &self.step, &state, &self.scope).await;
            report.processed += 1;
            report.retries += result.retries;
            report.elapsed += result.elapsed;
            report.used_fallback |= result.used_fallback;

            let forward = if result.skipped {
                report.skipped += 1;
                unit
            } else if let Some(value) = result.output {
                value
            } else {
                let stop = self.runner.stops_chain(&self.step, &result);
                if let Some(e) = result.error {
                    report.failures.push(e);
                }
                if stop {
                    debug!(execution_id = %self.runner.execution_id(), stage = self.index, "Stage failure stops the pipeline");
                    self.scope.cancel();
                    break;
                }
                continue;
            };

            tokio::select! {
                biased;
                _ = self.scope.done() => break,
                sent = tx.send(forward) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        report
    }

    /// Seed variables overlaid with the unit's fields and the unit itself.
    fn unit_state(&self, unit: &serde_json::Value) -> Vars {
        let mut state = self.seed.clone();
        if let serde_json::Value::Object(fields) = unit {
            state.extend(fields.clone());
        }
        state.insert(STREAM_DATA_KEY.to_string(), unit.clone());
        state
    }
}

#[derive(Debug)]
struct StageReport {
    index: usize,
    tool: String,
    processed: usize,
    skipped: usize,
    retries: u32,
    used_fallback: bool,
    elapsed: Duration,
    failures: Vec<WeaveError>,
}

impl StageReport {
    fn new(index: usize, tool: &str) -> Self {
        Self {
            index,
            tool: tool.to_string(),
            processed: 0,
            skipped: 0,
            retries: 0,
            used_fallback: false,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    fn record(self, agg: &mut ResultAggregator) {
        for failure in &self.failures {
            agg.record_failure(self.index, &self.tool, failure);
        }
        agg.record_summary(StepSummary {
            step: self.index,
            tool: self.tool,
            success: self.failures.is_empty(),
            skipped: self.processed > 0 && self.skipped == self.processed,
            used_fallback: self.used_fallback,
            retries: self.retries,
            elapsed_ms: self.elapsed.as_millis() as u64,
        });
    }
}
