use tracing::{info, warn};

use weave_core::types::ToolChain;

use crate::aggregate::ResultAggregator;
use crate::runner::StepRunner;
use crate::scope::Scope;

/// Run steps one at a time in declared order.
///
/// A failure stops the chain when the step's strategy is `Stop` or the
/// chain itself timed out or was cancelled; otherwise it is recorded and
/// the next step runs.
pub async fn run_sequential(
    runner: &StepRunner,
    chain: &ToolChain,
    scope: &Scope,
    agg: &mut ResultAggregator,
) {
    for (index, step) in chain.steps.iter().enumerate() {
        if scope.is_done() {
            let err = runner.interrupted(scope);
            warn!(execution_id = %runner.execution_id(), step = index, error = %err, "Chain interrupted before step");
            agg.fail_chain(&err);
            return;
        }

        let result = runner.run(index, step, agg.data(), scope).await;
        let stop = runner.stops_chain(step, &result);
        agg.record(result);

        if stop {
            info!(execution_id = %runner.execution_id(), step = index, tool = %step.tool, "Stopping chain after failed step");
            return;
        }
    }
}
