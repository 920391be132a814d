use crate::{
    events::EventEmitter, ConfigExt, ExecutionContext, NodeError, NodeId, NodeSpec, Value,
    ValueMap, Workflow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that every node type implements.
///
/// One instance serves every node of its type across all runs, so
/// implementations keep per-invocation state on the stack.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Type tag matched against `NodeSpec::node_type` (e.g. "http", "condition")
    fn node_type(&self) -> &str;

    /// Execute one node invocation
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: description and ports, shown by `flow nodes` and `/api/nodes`
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }

    /// True when the executor reads `retryCount` itself, so the engine
    /// must not retry it again.
    fn handles_retries(&self) -> bool {
        false
    }
}

/// Read-only executor lookup handed to executors that wrap other executors.
pub trait ExecutorLookup: Send + Sync {
    fn executor(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    /// The node being executed
    pub node: Arc<NodeSpec>,

    /// Resolved inputs: variables, predecessor outputs and wired ports
    pub inputs: ValueMap,

    /// Static configuration for this node
    pub config: ValueMap,

    /// Ids of direct predecessors, sorted
    pub predecessors: Vec<NodeId>,

    /// Shared per-run state
    pub run: Arc<ExecutionContext>,

    /// Registry view for wrapper executors
    pub executors: Arc<dyn ExecutorLookup>,

    /// The workflow this node belongs to
    pub workflow: Arc<Workflow>,

    /// Event emitter for real-time log lines
    pub events: EventEmitter,

    /// Fires when the run is cancelled or times out
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Required non-empty string config
    pub fn require_config_str(&self, name: &str) -> Result<String, NodeError> {
        match self.config.get_str(name) {
            Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
            _ => Err(NodeError::Configuration(format!("Missing config: {}", name))),
        }
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), NodeError> {
        if self.cancellation.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Context for invoking another executor inline on behalf of this node.
    pub fn derive(&self, node: NodeSpec, inputs: ValueMap) -> NodeContext {
        let mut ctx = self.clone();
        ctx.config = node.config.clone();
        ctx.node = Arc::new(node);
        ctx.inputs = inputs;
        ctx
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: ValueMap,

    /// When set, only out-edges whose source handle matches are followed
    pub next_handle: Option<String>,

    pub logs: Vec<LogEntry>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(outputs: ValueMap) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_next_handle(mut self, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        self.next_handle = if handle.is_empty() { None } else { Some(handle) };
        self
    }

    pub fn with_log(mut self, entry: LogEntry) -> Self {
        self.logs.push(entry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Record of one node's execution within a run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeStatus,
    pub outputs: ValueMap,
    #[serde(serialize_with = "serialize_node_error")]
    pub error: Option<NodeError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub logs: Vec<LogEntry>,
    pub next_handle: Option<String>,
}

impl NodeResult {
    /// A node that never ran, e.g. on an unselected branch.
    pub fn skipped(node: &NodeSpec, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: NodeStatus::Skipped,
            outputs: ValueMap::new(),
            error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            logs: vec![LogEntry::info(reason)],
            next_handle: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }
}

fn serialize_node_error<S: Serializer>(
    error: &Option<NodeError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl NodeMetadata {
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, name: &str, description: &str, required: bool) -> Self {
        self.inputs.push(PortDefinition::new(name, description, required));
        self
    }

    pub fn output(mut self, name: &str, description: &str) -> Self {
        self.outputs.push(PortDefinition::new(name, description, false));
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required,
        }
    }
}
