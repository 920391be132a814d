use crate::adapters::{AuditEvent, AuditSink, TokenUsage};
use crate::node::LogEntry;
use crate::{Value, ValueMap};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-run mutable state shared by the engine and every executor of a run.
///
/// All reads and writes of variables, outputs and counters go through one
/// mutex. Outputs are cloned on the way in and out so callers never observe
/// another node's in-progress mutation.
pub struct ExecutionContext {
    execution_id: String,
    workflow_id: String,
    user_id: String,
    workspace_id: String,
    trigger_type: String,
    trigger_data: ValueMap,
    credentials: HashMap<String, String>,
    audit: Option<Arc<dyn AuditSink>>,
    cancellation: CancellationToken,
    state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    variables: ValueMap,
    outputs: HashMap<String, ValueMap>,
    token_usage: TokenUsage,
    variable_logs: HashMap<String, Vec<LogEntry>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            user_id: String::new(),
            workspace_id: String::new(),
            trigger_type: "manual".to_string(),
            trigger_data: ValueMap::new(),
            credentials: HashMap::new(),
            audit: None,
            cancellation: CancellationToken::new(),
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_trigger(mut self, trigger_type: impl Into<String>, data: ValueMap) -> Self {
        self.trigger_type = trigger_type.into();
        self.trigger_data = data;
        self
    }

    pub fn with_credential(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials.insert(provider.into(), secret.into());
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Links the run to a caller scope: cancelling `parent` cancels the run.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = parent.child_token();
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn trigger_type(&self) -> &str {
        &self.trigger_type
    }

    pub fn trigger_data(&self) -> &ValueMap {
        &self.trigger_data
    }

    pub fn credential(&self, provider: &str) -> Option<&str> {
        self.credentials.get(provider).map(String::as_str)
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        // A panicking executor must not take the whole run down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_output(&self, node_id: &str, outputs: &ValueMap) {
        self.lock().outputs.insert(node_id.to_string(), outputs.clone());
    }

    pub fn get_output(&self, node_id: &str) -> Option<ValueMap> {
        self.lock().outputs.get(node_id).cloned()
    }

    pub fn outputs_snapshot(&self) -> HashMap<String, ValueMap> {
        self.lock().outputs.clone()
    }

    /// Writes a global variable and records the write against `node_id`.
    pub fn set_variable(&self, node_id: &str, name: &str, value: Value) {
        let mut state = self.lock();
        state
            .variable_logs
            .entry(node_id.to_string())
            .or_default()
            .push(LogEntry::info(format!(
                "set variable '{}' = {}",
                name,
                value.to_display_string()
            )));
        state.variables.insert(name.to_string(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.lock().variables.get(name).cloned()
    }

    pub fn variables(&self) -> ValueMap {
        self.lock().variables.clone()
    }

    /// Seeds variables from the run's initial inputs.
    pub fn init_variables(&self, inputs: &ValueMap) {
        let mut state = self.lock();
        for (k, v) in inputs {
            state.variables.insert(k.clone(), v.clone());
        }
    }

    pub fn take_variable_logs(&self, node_id: &str) -> Vec<LogEntry> {
        self.lock().variable_logs.remove(node_id).unwrap_or_default()
    }

    pub fn add_token_usage(&self, usage: &TokenUsage) {
        self.lock().token_usage.add(usage);
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.lock().token_usage
    }

    /// Idempotent; safe to call from any number of tasks.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Best-effort, fire-and-forget. Sink failures are logged and dropped.
    pub fn record_audit(&self, mut event: AuditEvent) {
        let Some(sink) = self.audit.clone() else {
            tracing::debug!(action = %event.action, "No audit sink configured, dropping event");
            return;
        };
        event.execution_id = self.execution_id.clone();
        event.workflow_id = self.workflow_id.clone();
        event.user_id = self.user_id.clone();
        event.workspace_id = self.workspace_id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let action = event.action.clone();
                    if let Err(e) = sink.record(event).await {
                        tracing::warn!(action = %action, "Audit sink failed: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!(action = %event.action, "No runtime available for audit sink"),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("workflow_id", &self.workflow_id)
            .field("user_id", &self.user_id)
            .field("workspace_id", &self.workspace_id)
            .field("trigger_type", &self.trigger_type)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
