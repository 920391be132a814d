use crate::dag::Dag;
use crate::registry::NodeRegistry;
use crate::resolver::resolve_inputs;
use crate::scheduler::execution_levels;
use chrono::{DateTime, Utc};
use flowcore::{
    ConfigExt, EventBus, ExecutionContext, ExecutionEvent, FlowError, LogEntry, NodeContext,
    NodeError, NodeExecutor, NodeOutput, NodeResult, NodeSpec, NodeStatus, TokenUsage, Value, ValueMap,
    Workflow,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::DropGuard;

const OUTPUT_NODE_TYPE: &str = "output";
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Result of workflow execution
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub outputs: ValueMap,
    pub error: Option<FlowError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub node_results: HashMap<String, NodeResult>,
    pub token_usage: TokenUsage,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|r| r.status)
    }
}

/// Executes workflows level by level with bounded parallelism
pub struct WorkflowExecutor {
    max_concurrent: usize,
    timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            timeout,
        }
    }

    /// Execute a workflow and return its run result.
    ///
    /// Never returns early with `Err`: validation failures, node failures,
    /// timeouts and cancellation are all reported through `RunResult`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        registry: Arc<NodeRegistry>,
        event_bus: &EventBus,
        inputs: ValueMap,
        ctx: Arc<ExecutionContext>,
    ) -> RunResult {
        let mut run = RunTracker::new(ctx.clone(), event_bus.clone(), workflow.nodes.len());
        run.emit(ExecutionEvent::RunStarted {
            execution_id: run.execution_id(),
            workflow_id: run.workflow_id(),
            total_nodes: run.total,
            timestamp: Utc::now(),
        });
        tracing::info!(
            execution_id = %ctx.execution_id(),
            "Starting workflow execution: {}",
            ctx.workflow_id()
        );

        let timed_out = Arc::new(AtomicBool::new(false));
        let _watcher = self.spawn_watcher(ctx.clone(), timed_out.clone());

        let dag = match Dag::build(workflow) {
            Ok(dag) => Arc::new(dag),
            Err(e) => return run.fail(FlowError::Workflow(e)),
        };
        ctx.init_variables(&inputs);
        let levels = match execution_levels(&dag) {
            Ok(levels) => levels,
            Err(e) => return run.fail(FlowError::Workflow(e)),
        };

        let workflow = Arc::new(workflow.clone());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut active: HashSet<String> = HashSet::from([dag.start_node_id().to_string()]);

        for level in &levels {
            if let Some(result) = self.check_interrupted(&mut run, &dag, &timed_out) {
                return result;
            }

            let mut handles = Vec::with_capacity(level.len());
            for node_id in level {
                let Some(node) = dag.node(node_id) else {
                    continue;
                };
                if !active.contains(node_id) && dag.in_degree(node_id) > 0 {
                    run.skip(node, "not on a selected branch");
                    continue;
                }
                let task = NodeTask {
                    node: Arc::new(node.clone()),
                    predecessors: dag.predecessors(node_id),
                    dag: dag.clone(),
                    workflow: workflow.clone(),
                    registry: registry.clone(),
                    ctx: ctx.clone(),
                    bus: event_bus.clone(),
                    sem: semaphore.clone(),
                    progress: run.progress.clone(),
                    total: run.total,
                };
                handles.push((node.clone(), tokio::spawn(task.run())));
            }

            // Wait for every task in the level, even after a failure, so the
            // outputs cache is settled before returning.
            let mut failure: Option<(String, NodeError)> = None;
            for (node, handle) in handles {
                let result = match handle.await {
                    Ok(Some(result)) => result,
                    Ok(None) => continue,
                    Err(join_err) => {
                        tracing::error!(node_id = %node.id, "Node task aborted: {}", join_err);
                        run.task_lost(&node, join_err.to_string())
                    }
                };
                if result.status == NodeStatus::Completed {
                    activate_successors(&dag, &result, &mut active);
                }
                if let (NodeStatus::Failed, Some(err)) = (result.status, &result.error) {
                    if failure.is_none() {
                        failure = Some((result.node_id.clone(), err.clone()));
                    }
                }
                run.record(result);
            }

            if let Some(result) = self.check_interrupted(&mut run, &dag, &timed_out) {
                return result;
            }
            if let Some((node_id, error)) = failure {
                tracing::error!(node_id = %node_id, "Node failed: {}", error);
                return run.fail(FlowError::node(node_id, error));
            }
        }

        if let Some(result) = self.check_interrupted(&mut run, &dag, &timed_out) {
            return result;
        }

        let mut outputs = ValueMap::new();
        for end_id in dag.end_node_ids() {
            if let Some(end_outputs) = ctx.get_output(end_id) {
                outputs.extend(end_outputs);
            }
        }
        if let Some(schema) = build_output_schema(&dag, &run.results) {
            outputs.insert("output_schema".to_string(), schema);
        }
        run.complete(outputs)
    }

    fn check_interrupted(
        &self,
        run: &mut RunTracker,
        dag: &Dag,
        timed_out: &AtomicBool,
    ) -> Option<RunResult> {
        if timed_out.load(Ordering::SeqCst) {
            Some(run.time_out(dag, self.timeout))
        } else if run.ctx.is_cancelled() {
            Some(run.cancelled(dag))
        } else {
            None
        }
    }

    /// Cancels the run context when the deadline passes. Stops on its own
    /// when the run is cancelled or the returned guard is dropped.
    fn spawn_watcher(&self, ctx: Arc<ExecutionContext>, timed_out: Arc<AtomicBool>) -> DropGuard {
        let done = tokio_util::sync::CancellationToken::new();
        let stop = done.clone();
        let limit = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    tracing::warn!(execution_id = %ctx.execution_id(), "Run exceeded timeout of {:?}", limit);
                    timed_out.store(true, Ordering::SeqCst);
                    ctx.cancel();
                }
                _ = ctx.cancelled() => {}
                _ = stop.cancelled() => {}
            }
        });
        done.drop_guard()
    }
}

/// Adds the targets of the edges a completed node selected.
///
/// With a next-handle only edges on that handle are followed; if none carry
/// it, edges on the default (empty) handle are. Without a next-handle every
/// out-edge is followed.
fn activate_successors(dag: &Dag, result: &NodeResult, active: &mut HashSet<String>) {
    let edges = dag.out_edges(&result.node_id);
    match result.next_handle.as_deref() {
        Some(handle) => {
            let mut selected: Vec<_> = edges.iter().filter(|e| e.source_handle == handle).collect();
            if selected.is_empty() {
                selected = edges.iter().filter(|e| e.source_handle.is_empty()).collect();
            }
            for edge in selected {
                active.insert(edge.target.clone());
            }
        }
        None => {
            for edge in edges {
                active.insert(edge.target.clone());
            }
        }
    }
}

fn build_output_schema(dag: &Dag, results: &HashMap<String, NodeResult>) -> Option<Value> {
    let mut ids: Vec<&str> = dag
        .nodes()
        .iter()
        .filter(|n| n.node_type == OUTPUT_NODE_TYPE)
        .map(|n| n.id.as_str())
        .collect();
    ids.sort_unstable();

    let items: Vec<Value> = ids
        .into_iter()
        .filter_map(|id| {
            let result = results.get(id).filter(|r| r.status == NodeStatus::Completed)?;
            let node = dag.node(id)?;
            let outputs = &result.outputs;
            let value = outputs
                .get("output")
                .filter(|v| !v.is_null())
                .or_else(|| outputs.get("value"))
                .cloned()
                .unwrap_or_default();
            let mut item = ValueMap::new();
            item.insert("node_id".into(), Value::from(id));
            item.insert("label".into(), Value::from(node.label.as_str()));
            item.insert("title".into(), outputs.get("title").cloned().unwrap_or_default());
            item.insert("type".into(), outputs.get("type").cloned().unwrap_or_default());
            item.insert("value".into(), value);
            item.insert(
                "show_timestamp".into(),
                outputs.get("showTimestamp").cloned().unwrap_or_default(),
            );
            Some(Value::Object(item))
        })
        .collect();

    if items.is_empty() {
        return None;
    }
    let mut schema = ValueMap::new();
    schema.insert("version".into(), Value::from("1.0"));
    schema.insert("items".into(), Value::Array(items));
    Some(Value::Object(schema))
}

/// Bookkeeping for one run: node results, progress and terminal events.
struct RunTracker {
    ctx: Arc<ExecutionContext>,
    bus: EventBus,
    total: usize,
    progress: Arc<AtomicUsize>,
    results: HashMap<String, NodeResult>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl RunTracker {
    fn new(ctx: Arc<ExecutionContext>, bus: EventBus, total: usize) -> Self {
        Self {
            ctx,
            bus,
            total,
            progress: Arc::new(AtomicUsize::new(0)),
            results: HashMap::new(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn execution_id(&self) -> String {
        self.ctx.execution_id().to_string()
    }

    fn workflow_id(&self) -> String {
        self.ctx.workflow_id().to_string()
    }

    fn emit(&self, event: ExecutionEvent) {
        self.bus.emit(event);
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn record(&mut self, result: NodeResult) {
        self.results.insert(result.node_id.clone(), result);
    }

    fn skip(&mut self, node: &NodeSpec, reason: &str) {
        let done = self.progress.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(node_id = %node.id, "Skipping node: {}", reason);
        self.emit(ExecutionEvent::NodeSkipped {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            reason: reason.to_string(),
            progress: percent(done, self.total),
            total_nodes: self.total,
            timestamp: Utc::now(),
        });
        self.record(NodeResult::skipped(node, reason));
    }

    /// A task that died without reporting, e.g. aborted by the runtime.
    fn task_lost(&mut self, node: &NodeSpec, message: String) -> NodeResult {
        let error = NodeError::Panicked(message);
        let done = self.progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(ExecutionEvent::NodeFailed {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            duration_ms: 0,
            progress: percent(done, self.total),
            total_nodes: self.total,
            timestamp: Utc::now(),
        });
        let now = Utc::now();
        NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: NodeStatus::Failed,
            outputs: ValueMap::new(),
            error: Some(error),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            logs: Vec::new(),
            next_handle: None,
        }
    }

    /// Nodes that never reached a terminal state are reported skipped.
    fn mark_unfinished(&mut self, dag: &Dag, reason: &str) {
        for node in dag.nodes() {
            if !self.results.contains_key(&node.id) {
                self.results
                    .insert(node.id.clone(), NodeResult::skipped(node, reason));
            }
        }
    }

    fn finish(&mut self, status: RunStatus, outputs: ValueMap, error: Option<FlowError>) -> RunResult {
        RunResult {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            status,
            outputs,
            error,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.elapsed_ms(),
            node_results: std::mem::take(&mut self.results),
            token_usage: self.ctx.token_usage(),
        }
    }

    fn fail(&mut self, error: FlowError) -> RunResult {
        tracing::error!(execution_id = %self.ctx.execution_id(), "Workflow failed: {}", error);
        self.ctx.cancel();
        self.emit(ExecutionEvent::RunFailed {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            duration_ms: self.elapsed_ms(),
            timestamp: Utc::now(),
        });
        self.finish(RunStatus::Failed, ValueMap::new(), Some(error))
    }

    fn time_out(&mut self, dag: &Dag, limit: Duration) -> RunResult {
        self.mark_unfinished(dag, "cancelled: run timed out");
        self.fail(FlowError::Timeout {
            millis: limit.as_millis() as u64,
        })
    }

    fn cancelled(&mut self, dag: &Dag) -> RunResult {
        tracing::info!(execution_id = %self.ctx.execution_id(), "Workflow cancelled");
        self.mark_unfinished(dag, "cancelled");
        self.emit(ExecutionEvent::RunCancelled {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            duration_ms: self.elapsed_ms(),
            timestamp: Utc::now(),
        });
        self.finish(RunStatus::Cancelled, ValueMap::new(), None)
    }

    fn complete(&mut self, outputs: ValueMap) -> RunResult {
        let duration_ms = self.elapsed_ms();
        tracing::info!(
            execution_id = %self.ctx.execution_id(),
            "Workflow completed in {}ms",
            duration_ms
        );
        self.emit(ExecutionEvent::RunCompleted {
            execution_id: self.execution_id(),
            workflow_id: self.workflow_id(),
            outputs: outputs.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        self.finish(RunStatus::Completed, outputs, None)
    }
}

fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        100
    } else {
        (done * 100 / total).min(100) as u32
    }
}

/// Everything one spawned node execution needs.
struct NodeTask {
    node: Arc<NodeSpec>,
    predecessors: Vec<String>,
    dag: Arc<Dag>,
    workflow: Arc<Workflow>,
    registry: Arc<NodeRegistry>,
    ctx: Arc<ExecutionContext>,
    bus: EventBus,
    sem: Arc<Semaphore>,
    progress: Arc<AtomicUsize>,
    total: usize,
}

impl NodeTask {
    /// Acquire a slot, check cancellation, run the executor.
    ///
    /// Returns `None` when the node never started because the run was
    /// cancelled while it waited for a slot.
    async fn run(self) -> Option<NodeResult> {
        let _permit = self.sem.acquire().await.ok()?;
        if self.ctx.is_cancelled() {
            return None;
        }

        let node_id = self.node.id.clone();
        let inputs = resolve_inputs(&self.dag, &node_id, &self.ctx);
        self.bus.emit(ExecutionEvent::NodeStarted {
            execution_id: self.ctx.execution_id().to_string(),
            workflow_id: self.ctx.workflow_id().to_string(),
            node_id: node_id.clone(),
            node_type: self.node.node_type.clone(),
            inputs: inputs.clone(),
            timestamp: Utc::now(),
        });
        tracing::debug!(node_id = %node_id, node_type = %self.node.node_type, "Node started");

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.invoke(inputs).await;
        let duration_ms = clock.elapsed().as_millis() as u64;
        let done = self.progress.fetch_add(1, Ordering::SeqCst) + 1;

        let mut result = NodeResult {
            node_id: node_id.clone(),
            node_type: self.node.node_type.clone(),
            status: NodeStatus::Completed,
            outputs: ValueMap::new(),
            error: None,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            logs: Vec::new(),
            next_handle: None,
        };

        match outcome {
            Ok(output) => {
                self.ctx.set_output(&node_id, &output.outputs);
                tracing::info!("Node {} completed in {}ms", node_id, duration_ms);
                self.bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id: self.ctx.execution_id().to_string(),
                    workflow_id: self.ctx.workflow_id().to_string(),
                    node_id: node_id.clone(),
                    node_type: self.node.node_type.clone(),
                    outputs: output.outputs.clone(),
                    duration_ms,
                    progress: percent(done, self.total),
                    total_nodes: self.total,
                    timestamp: Utc::now(),
                });
                result.outputs = output.outputs;
                result.next_handle = output.next_handle;
                result.logs = output.logs;
            }
            Err(NodeError::Cancelled) => {
                tracing::info!("Node {} cancelled", node_id);
                self.bus.emit(ExecutionEvent::NodeSkipped {
                    execution_id: self.ctx.execution_id().to_string(),
                    workflow_id: self.ctx.workflow_id().to_string(),
                    node_id: node_id.clone(),
                    node_type: self.node.node_type.clone(),
                    reason: "cancelled".to_string(),
                    progress: percent(done, self.total),
                    total_nodes: self.total,
                    timestamp: Utc::now(),
                });
                result.status = NodeStatus::Skipped;
                result.logs.push(LogEntry::warn("cancelled"));
            }
            Err(e) => {
                tracing::error!("Node {} failed: {}", node_id, e);
                self.bus.emit(ExecutionEvent::NodeFailed {
                    execution_id: self.ctx.execution_id().to_string(),
                    workflow_id: self.ctx.workflow_id().to_string(),
                    node_id: node_id.clone(),
                    node_type: self.node.node_type.clone(),
                    error_kind: e.kind().to_string(),
                    error: e.to_string(),
                    duration_ms,
                    progress: percent(done, self.total),
                    total_nodes: self.total,
                    timestamp: Utc::now(),
                });
                result.status = NodeStatus::Failed;
                result.logs.push(LogEntry::error(e.to_string()));
                result.error = Some(e);
            }
        }

        result.logs.extend(self.ctx.take_variable_logs(&node_id));
        Some(result)
    }

    /// Executor lookup and invocation, bounded by the node's own `timeout`
    /// config (milliseconds) across all attempts. Panics become node failures.
    async fn invoke(&self, inputs: ValueMap) -> Result<NodeOutput, NodeError> {
        let executor = self
            .registry
            .get(&self.node.node_type)
            .ok_or_else(|| NodeError::ExecutorNotFound(self.node.node_type.clone()))?;

        let node_ctx = NodeContext {
            node: self.node.clone(),
            inputs,
            config: self.node.config.clone(),
            predecessors: self.predecessors.clone(),
            run: self.ctx.clone(),
            executors: self.registry.clone(),
            workflow: self.workflow.clone(),
            events: self.bus.create_emitter(
                self.ctx.execution_id(),
                self.ctx.workflow_id(),
                &self.node.id,
            ),
            cancellation: self.ctx.cancellation_token(),
        };

        let call = AssertUnwindSafe(self.attempts(executor, node_ctx)).catch_unwind();
        let timeout_ms = self.node.config.get_i64_or("timeout", 0);
        let outcome = if timeout_ms > 0 {
            let limit = Duration::from_millis(timeout_ms as u64);
            match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(NodeError::Timeout {
                        millis: timeout_ms as u64,
                    })
                }
            }
        } else {
            call.await
        };

        outcome.unwrap_or_else(|panic| Err(NodeError::Panicked(panic_message(panic))))
    }

    /// Runs the executor, retrying recoverable failures when the node sets
    /// `retryCount`. The wait starts at `retryDelay` (milliseconds, default
    /// 1000) and doubles per attempt up to [`MAX_RETRY_BACKOFF`].
    async fn attempts(
        &self,
        executor: Arc<dyn NodeExecutor>,
        node_ctx: NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let retries = if executor.handles_retries() {
            0
        } else {
            self.node.config.get_i64_or("retryCount", 0).max(0) as u32
        };
        let mut backoff =
            Duration::from_millis(self.node.config.get_i64_or("retryDelay", 1000).max(0) as u64);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match executor.execute(node_ctx.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_recoverable() || attempt > retries => return Err(e),
                Err(e) => e,
            };

            tracing::warn!(node_id = %self.node.id, attempt, error = %error, "Node attempt failed, retrying in {:?}", backoff);
            node_ctx
                .events
                .warn(format!("Attempt {} failed: {}", attempt, error));
            tokio::select! {
                _ = self.ctx.cancelled() => return Err(NodeError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
