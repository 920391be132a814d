use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Run-level failure surfaced on a `RunResult` and in `run-failed` events.
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Node {node_id} failed: {error}")]
    Node {
        node_id: String,
        #[source]
        error: NodeError,
    },

    #[error("Run timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    pub fn node(node_id: impl Into<String>, error: NodeError) -> Self {
        FlowError::Node {
            node_id: node_id.into(),
            error,
        }
    }

    /// Stable snake_case identifier, e.g. `cycle_detected` or `timeout`.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Workflow(e) => e.kind(),
            FlowError::Node { error, .. } => error.kind(),
            FlowError::Timeout { .. } => "deadline_exceeded",
            FlowError::Cancelled => "cancelled",
            FlowError::Execution(_) => "execution_failed",
            FlowError::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Serialization(e.to_string())
    }
}

impl Serialize for FlowError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("FlowError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Failure of a single node execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No executor registered for node type '{0}'")]
    ExecutorNotFound(String),

    #[error("Network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("Adapter error: {message}")]
    Adapter { message: String, retryable: bool },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Unsafe operation: {0}")]
    UnsafeOperation(String),

    #[error("Webhook signature mismatch")]
    SignatureMismatch,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("IP address not whitelisted: {0}")]
    IpNotWhitelisted(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Iteration limit of {max} exceeded")]
    IterationLimit { max: usize },

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl NodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::MissingInput(_) => "missing_input",
            NodeError::InvalidInputType { .. } => "invalid_input_type",
            NodeError::Configuration(_) => "invalid_configuration",
            NodeError::ExecutorNotFound(_) => "executor_not_found",
            NodeError::Network { .. } => "network_failure",
            NodeError::Adapter { .. } => "adapter_failure",
            NodeError::Timeout { .. } => "timeout",
            NodeError::Cancelled => "cancelled",
            NodeError::UnsafeOperation(_) => "unsafe_operation",
            NodeError::SignatureMismatch => "signature_mismatch",
            NodeError::MethodNotAllowed(_) => "method_not_allowed",
            NodeError::IpNotWhitelisted(_) => "ip_not_whitelisted",
            NodeError::Validation(_) => "validation_failure",
            NodeError::IterationLimit { .. } => "iteration_limit",
            NodeError::Panicked(_) => "panic_recovered",
            NodeError::ExecutionFailed(_) => "execution_failed",
        }
    }

    /// Whether an error-recovery wrapper may absorb this error at all.
    /// Cancellation and unsafe operations always propagate.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NodeError::Cancelled | NodeError::UnsafeOperation(_))
    }
}

/// Structural problems found while validating or scheduling a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Cyclic dependency detected at node {0}")]
    CyclicDependency(String),

    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Workflow has {0} start nodes, expected exactly one")]
    MultipleStartNodes(usize),

    #[error("Edge {edge} references unknown node {node}")]
    DanglingEdge { edge: String, node: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::CyclicDependency(_) => "cycle_detected",
            WorkflowError::NoStartNode => "no_start_node",
            WorkflowError::MultipleStartNodes(_) => "multiple_start_nodes",
            WorkflowError::DanglingEdge { .. } => "dangling_edge",
            WorkflowError::DuplicateNode(_) => "duplicate_node",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Invalid(_) => "invalid_workflow",
        }
    }
}
