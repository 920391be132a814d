use super::EventBus;
use crate::node::LogLevel;
use crate::{NodeId, ValueMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ExecutionId = String;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        workflow_id: String,
        outputs: ValueMap,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        execution_id: ExecutionId,
        workflow_id: String,
        error_kind: String,
        error: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        execution_id: ExecutionId,
        workflow_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        node_id: NodeId,
        node_type: String,
        inputs: ValueMap,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        workflow_id: String,
        node_id: NodeId,
        node_type: String,
        outputs: ValueMap,
        duration_ms: u64,
        progress: u32,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        workflow_id: String,
        node_id: NodeId,
        node_type: String,
        error_kind: String,
        error: String,
        duration_ms: u64,
        progress: u32,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        workflow_id: String,
        node_id: NodeId,
        node_type: String,
        reason: String,
        progress: u32,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    Log {
        execution_id: ExecutionId,
        workflow_id: String,
        node_id: NodeId,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Kebab-case kind, e.g. `node-completed`.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::RunStarted { .. } => "run-started",
            ExecutionEvent::RunCompleted { .. } => "run-completed",
            ExecutionEvent::RunFailed { .. } => "run-failed",
            ExecutionEvent::RunCancelled { .. } => "run-cancelled",
            ExecutionEvent::NodeStarted { .. } => "node-started",
            ExecutionEvent::NodeCompleted { .. } => "node-completed",
            ExecutionEvent::NodeFailed { .. } => "node-failed",
            ExecutionEvent::NodeSkipped { .. } => "node-skipped",
            ExecutionEvent::Log { .. } => "log",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::RunCompleted { execution_id, .. }
            | ExecutionEvent::RunFailed { execution_id, .. }
            | ExecutionEvent::RunCancelled { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::NodeSkipped { execution_id, .. }
            | ExecutionEvent::Log { execution_id, .. } => execution_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeStarted { node_id, .. }
            | ExecutionEvent::NodeCompleted { node_id, .. }
            | ExecutionEvent::NodeFailed { node_id, .. }
            | ExecutionEvent::NodeSkipped { node_id, .. }
            | ExecutionEvent::Log { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// True for the single event that closes a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::RunCompleted { .. }
                | ExecutionEvent::RunFailed { .. }
                | ExecutionEvent::RunCancelled { .. }
        )
    }
}

/// Event emitter for nodes to send real-time log lines
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    workflow_id: String,
    node_id: NodeId,
    bus: EventBus,
}

impl EventEmitter {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
        bus: EventBus,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            bus,
        }
    }

    /// Emit a log event for this node
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.bus.emit(ExecutionEvent::Log {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            node_id: self.node_id.clone(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}
