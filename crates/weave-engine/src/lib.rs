//! Tool-chain execution.
//!
//! A [`ToolChain`](weave_core::types::ToolChain) is validated into a
//! [`DependencyGraph`], then run by one of three executors:
//! sequential, bounded-parallel or streaming pipeline. Every executor runs
//! steps through the same [`StepRunner`] (conditions, retries, fallback,
//! timeouts) and collects results in a [`ResultAggregator`].

pub mod aggregate;
pub mod composed;
pub mod condition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod runner;
pub mod scope;

pub use aggregate::ResultAggregator;
pub use composed::ComposedTool;
pub use engine::ToolEngine;
pub use executor::{PipelineOutput, PipelineRun};
pub use graph::{validate_chain, DependencyGraph};
pub use runner::{StepResult, StepRunner};
pub use scope::Scope;
