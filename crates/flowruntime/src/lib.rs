//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: graph validation,
//! level scheduling, input resolution, the executor registry and the
//! level-driven executor with cancellation and timeouts.

pub mod dag;
mod executor;
mod registry;
pub mod resolver;
mod runtime;
pub mod scheduler;

pub use dag::Dag;
pub use executor::{RunResult, RunStatus, WorkflowExecutor};
pub use registry::NodeRegistry;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use scheduler::execution_levels;
