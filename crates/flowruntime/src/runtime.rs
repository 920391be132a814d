use crate::{registry::NodeRegistry, RunResult, WorkflowExecutor};
use flowcore::{
    EventBus, EventHandler, ExecutionContext, ExecutionEvent, FlowError, NodeExecutor, ValueMap,
    Workflow, WorkflowError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: EventBus,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(NodeRegistry::new(), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: NodeRegistry, config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(config.max_concurrent, config.timeout));
        let event_bus = EventBus::new(config.event_buffer_size);

        Self {
            registry: Arc::new(registry),
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get access to the node registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Register an executor under its type tag. Last registration wins.
    ///
    /// Call before the first `execute`; runs already in flight keep the
    /// registry snapshot they started with.
    pub fn register_executor(&mut self, executor: Arc<dyn NodeExecutor>) {
        Arc::make_mut(&mut self.registry).register(executor);
    }

    /// Every handler receives every event, on its own task.
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.register_handler(handler);
    }

    /// Register a workflow
    pub async fn register_workflow(&self, id: impl Into<String>, workflow: Workflow) {
        let mut workflows = self.workflows.write().await;
        workflows.insert(id.into(), workflow);
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn remove_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.write().await.remove(id)
    }

    pub async fn list_workflows(&self) -> Vec<(String, Workflow)> {
        let workflows = self.workflows.read().await;
        let mut list: Vec<_> = workflows.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Execute a registered workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: ValueMap,
        ctx: Arc<ExecutionContext>,
    ) -> Result<RunResult, FlowError> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| FlowError::Workflow(WorkflowError::NotFound(workflow_id.to_string())))?;

        Ok(self.execute(&workflow, inputs, ctx).await)
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: ValueMap,
        ctx: Arc<ExecutionContext>,
    ) -> RunResult {
        self.executor
            .execute(workflow, self.registry.clone(), &self.event_bus, inputs, ctx)
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on nodes executing at once within one run
    pub max_concurrent: usize,
    /// Upper bound on total run wall time
    pub timeout: Duration,
    /// Per-subscriber event queue capacity
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout: Duration::from_secs(5 * 60),
            event_buffer_size: 1000,
        }
    }
}
