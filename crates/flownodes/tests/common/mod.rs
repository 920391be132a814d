#![allow(dead_code)]

use flowcore::{ExecutionContext, ExecutionEvent, NodeSpec, Workflow};
use flownodes::Adapters;
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

pub fn runtime() -> FlowRuntime {
    runtime_with(RuntimeConfig::default(), Adapters::default())
}

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn runtime_with(config: RuntimeConfig, adapters: Adapters) -> FlowRuntime {
    init_tracing();
    let mut registry = NodeRegistry::new();
    flownodes::register_all_with(&mut registry, adapters);
    FlowRuntime::with_registry(registry, config)
}

pub fn ctx() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::new("wf-test"))
}

/// `start -> node -> end`, the node under test with id `n`.
pub fn single(node: NodeSpec) -> Workflow {
    let id = node.id.clone();
    let mut wf = Workflow::new("single");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(node);
    wf.add_node(NodeSpec::new("e", "end"));
    wf.connect("s", id.clone());
    wf.connect(id, "e");
    wf
}

pub fn drain(rx: &mut Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn of_kind<'a>(events: &'a [ExecutionEvent], kind: &str) -> Vec<&'a ExecutionEvent> {
    events.iter().filter(|e| e.kind() == kind).collect()
}

pub fn node_ids(events: &[&ExecutionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.node_id().map(str::to_string))
        .collect()
}
