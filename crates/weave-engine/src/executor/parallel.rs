use std::cmp::Reverse;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use weave_core::error::WeaveError;
use weave_core::types::ToolChain;

use crate::aggregate::ResultAggregator;
use crate::graph::DependencyGraph;
use crate::runner::{StepResult, StepRunner};
use crate::scope::Scope;

/// Run steps concurrently as their dependencies allow, at most `slots` at a time.
///
/// Each round collects the steps whose dependencies all succeeded, orders
/// them by weight (higher first, then index) and starts as many as the slot
/// pool admits. The loop owns the aggregator: finished steps are recorded
/// here, one at a time, as they come back from the join set.
///
/// A `Stop` failure cancels the chain scope, so running steps see
/// cancellation and no further steps start. Steps that never started
/// because a dependency failed are reported as unsatisfied.
pub async fn run_parallel(
    runner: &StepRunner,
    chain: &ToolChain,
    graph: &DependencyGraph,
    scope: &Scope,
    slots: usize,
    agg: &mut ResultAggregator,
) {
    let pool = Arc::new(Semaphore::new(slots.max(1)));
    let mut started = vec![false; chain.steps.len()];
    let mut running: JoinSet<StepResult> = JoinSet::new();
    let mut halted = false;

    loop {
        if !halted {
            for index in ready_steps(chain, graph, agg, &started) {
                let permit = tokio::select! {
                    biased;
                    _ = scope.done() => None,
                    permit = Arc::clone(&pool).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    halted = true;
                    break;
                };
                if scope.is_done() {
                    halted = true;
                    break;
                }

                started[index] = true;
                let step = chain.steps[index].clone();
                debug!(execution_id = %runner.execution_id(), step = index, tool = %step.tool, weight = step.weight, "Scheduling ready step");

                let runner = runner.clone();
                let scope = scope.clone();
                let state = agg.snapshot();
                running.spawn(async move {
                    let result = runner.run(index, &step, &state, &scope).await;
                    // Cancel before the slot is released so nothing new starts.
                    if runner.stops_chain(&step, &result) {
                        scope.cancel();
                    }
                    drop(permit);
                    result
                });
            }
        }

        match running.join_next().await {
            None => break,
            Some(Ok(result)) => {
                let index = result.index;
                if runner.stops_chain(&chain.steps[index], &result) && !halted {
                    info!(execution_id = %runner.execution_id(), step = index, tool = %result.tool, "Stopping chain after failed step");
                    halted = true;
                }
                if scope.is_done() {
                    halted = true;
                }
                agg.record(result);
            }
            Some(Err(e)) => {
                error!(execution_id = %runner.execution_id(), error = %e, "Step task failed to join");
                halted = true;
            }
        }
    }

    report_unstarted(runner, chain, graph, scope, agg, &started);
}

/// Not-yet-started steps whose dependencies have all succeeded, in scheduling order.
fn ready_steps(
    chain: &ToolChain,
    graph: &DependencyGraph,
    agg: &ResultAggregator,
    started: &[bool],
) -> Vec<usize> {
    let mut ready: Vec<usize> = (0..chain.steps.len())
        .filter(|&i| !started[i] && graph.dependencies(i).iter().all(|&d| agg.is_satisfied(d)))
        .collect();
    ready.sort_by_key(|&i| (Reverse(chain.steps[i].weight), i));
    ready
}

fn report_unstarted(
    runner: &StepRunner,
    chain: &ToolChain,
    graph: &DependencyGraph,
    scope: &Scope,
    agg: &mut ResultAggregator,
    started: &[bool],
) {
    let unstarted: Vec<usize> = (0..started.len()).filter(|&i| !started[i]).collect();
    if unstarted.is_empty() {
        return;
    }

    if scope.is_expired() {
        let err = runner.interrupted(scope);
        warn!(execution_id = %runner.execution_id(), unstarted = unstarted.len(), "Chain timed out with steps pending");
        agg.fail_chain(&err);
        return;
    }
    if scope.is_cancelled() {
        // Stopped by a failure (already recorded) or cancelled by the caller.
        agg.fail_chain(&WeaveError::Cancelled);
        return;
    }

    for index in unstarted {
        let blocked_on = graph
            .dependencies(index)
            .iter()
            .find(|&&d| !agg.is_satisfied(d))
            .and_then(|&d| chain.steps[d].output_var.clone())
            .unwrap_or_default();
        let err = WeaveError::DependencyUnsatisfied {
            step: index,
            input: blocked_on,
        };
        warn!(execution_id = %runner.execution_id(), step = index, error = %err, "Step not run");
        agg.record_failure(index, &chain.steps[index].tool, &err);
    }
}
