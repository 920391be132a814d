//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the graph model, dynamic values, errors, the
//! per-run execution context, the executor trait, events and adapter
//! interfaces. It contains no scheduling logic.

pub mod adapters;
mod context;
mod error;
pub mod events;
mod node;
mod value;
mod workflow;

pub use adapters::TokenUsage;
pub use context::ExecutionContext;
pub use error::{FlowError, NodeError, WorkflowError};
pub use events::*;
pub use node::{
    ExecutorLookup, LogEntry, LogLevel, NodeContext, NodeExecutor, NodeMetadata, NodeOutput,
    NodeResult, NodeStatus, PortDefinition,
};
pub use value::{ConfigExt, Value, ValueMap};
pub use workflow::{
    Connection, NodeId, NodeSpec, PortSpec, Position, Workflow, WorkflowId, END_NODE_TYPE,
    START_NODE_TYPE,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
