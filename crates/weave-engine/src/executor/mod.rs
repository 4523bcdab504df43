//! Chain executors, one per [`ExecutionMode`](weave_core::types::ExecutionMode).

pub mod parallel;
pub mod pipeline;
pub mod sequential;

pub use parallel::run_parallel;
pub use pipeline::{run_pipeline, PipelineOutput, PipelineRun};
pub use sequential::run_sequential;
