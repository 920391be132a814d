// crates/flowruntime/tests/engine_test.rs

use async_trait::async_trait;
use flowcore::{
    ConfigExt, ExecutionContext, ExecutionEvent, NodeContext, NodeError, NodeExecutor,
    NodeOutput, NodeSpec, NodeStatus, Value, ValueMap, Workflow,
};
use flowruntime::{FlowRuntime, RunStatus, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Echoes inputs, optionally steering with `config.handle`.
struct Echo(&'static str);

#[async_trait]
impl NodeExecutor for Echo {
    fn node_type(&self) -> &str {
        self.0
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let handle = ctx.config.get_string("handle");
        Ok(NodeOutput::from_map(ctx.inputs).with_next_handle(handle))
    }
}

/// Records invocation order and sets `config.key = config.value` as a variable.
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NodeExecutor for Recorder {
    fn node_type(&self) -> &str {
        "record"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(ctx.node_id().to_string());
        let key = ctx.config.get_string("key");
        let mut out = NodeOutput::new();
        if let Some(value) = ctx.config.get("value") {
            ctx.run.set_variable(ctx.node_id(), &key, value.clone());
            out = out.with_output(key, value.clone());
        }
        Ok(out)
    }
}

/// Tracks how many invocations overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl NodeExecutor for Gauge {
    fn node_type(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::new())
    }
}

struct Fail;

#[async_trait]
impl NodeExecutor for Fail {
    fn node_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Err(NodeError::ExecutionFailed("boom".into()))
    }
}

struct Panics;

#[async_trait]
impl NodeExecutor for Panics {
    fn node_type(&self) -> &str {
        "panic"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        panic!("executor bug")
    }
}

/// Sleeps `config.ms`, returning early on cancellation.
struct Sleep;

#[async_trait]
impl NodeExecutor for Sleep {
    fn node_type(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx.config.get_i64_or("ms", 0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(NodeOutput::new()),
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

/// Fails with a non-retryable validation error until `config.failures`
/// calls have been made.
struct Flaky {
    calls: Arc<AtomicUsize>,
    self_retrying: bool,
}

#[async_trait]
impl NodeExecutor for Flaky {
    fn node_type(&self) -> &str {
        if self.self_retrying {
            "flaky_wrapper"
        } else {
            "flaky"
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call as i64 <= ctx.config.get_i64_or("failures", 0) {
            return Err(NodeError::Validation(format!("call {} rejected", call)));
        }
        Ok(NodeOutput::new().with_output("calls", call as i64))
    }

    fn handles_retries(&self) -> bool {
        self.self_retrying
    }
}

/// Surfaces cancellation as a transport failure, like an aborted request.
struct AbortsAsNetwork;

#[async_trait]
impl NodeExecutor for AbortsAsNetwork {
    fn node_type(&self) -> &str {
        "aborts"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.cancellation.cancelled().await;
        Err(NodeError::Network {
            message: "request aborted".into(),
            retryable: false,
        })
    }
}

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn runtime(config: RuntimeConfig) -> FlowRuntime {
    init_tracing();
    let mut rt = FlowRuntime::with_config(config);
    rt.register_executor(Arc::new(Echo("start")));
    rt.register_executor(Arc::new(Echo("end")));
    rt.register_executor(Arc::new(Echo("echo")));
    rt.register_executor(Arc::new(Fail));
    rt.register_executor(Arc::new(Panics));
    rt.register_executor(Arc::new(Sleep));
    rt
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[ExecutionEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .map(|e| (e.kind().to_string(), e.node_id().unwrap_or("").to_string()))
        .collect()
}

fn ctx() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::new("wf-test"))
}

#[tokio::test]
async fn test_dispatch_order_is_lexicographic() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut rt = runtime(RuntimeConfig {
        max_concurrent: 1,
        ..Default::default()
    });
    rt.register_executor(Arc::new(Recorder { calls: calls.clone() }));

    let mut wf = Workflow::new("order");
    wf.add_node(NodeSpec::new("s", "start"));
    for id in ["c", "a", "b"] {
        wf.add_node(NodeSpec::new(id, "record"));
        wf.connect("s", id);
    }

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_concurrency_bound_respected() {
    let gauge = Arc::new(Gauge::default());
    let mut rt = runtime(RuntimeConfig {
        max_concurrent: 3,
        ..Default::default()
    });
    rt.register_executor(gauge.clone());

    let mut wf = Workflow::new("wide");
    wf.add_node(NodeSpec::new("s", "start"));
    for i in 0..12 {
        let id = format!("g{:02}", i);
        wf.add_node(NodeSpec::new(&id, "gauge"));
        wf.connect("s", id);
    }

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert!(result.is_success());
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded bound", peak);
    assert!(peak >= 2, "nodes in a level should overlap");
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let rt = runtime(RuntimeConfig::default());
    let mut rx = rt.subscribe_events();

    let mut wf = Workflow::new("line");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("m", "echo"));
    wf.add_node(NodeSpec::new("e", "end"));
    wf.connect("s", "m");
    wf.connect("m", "e");

    let mut inputs = ValueMap::new();
    inputs.insert("greeting".into(), Value::from("hi"));
    let result = rt.execute(&wf, inputs, ctx()).await;
    assert!(result.is_success());
    assert_eq!(result.outputs.get("greeting"), Some(&Value::from("hi")));

    let events = drain(&mut rx);
    let expected: Vec<(String, String)> = [
        ("run-started", ""),
        ("node-started", "s"),
        ("node-completed", "s"),
        ("node-started", "m"),
        ("node-completed", "m"),
        ("node-started", "e"),
        ("node-completed", "e"),
        ("run-completed", ""),
    ]
    .iter()
    .map(|(k, n)| (k.to_string(), n.to_string()))
    .collect();
    assert_eq!(kinds(&events), expected);

    match &events[6] {
        ExecutionEvent::NodeCompleted { progress, total_nodes, .. } => {
            assert_eq!(*progress, 100);
            assert_eq!(*total_nodes, 3);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_unselected_branch_is_skipped() {
    let rt = runtime(RuntimeConfig::default());
    let mut rx = rt.subscribe_events();

    let mut wf = Workflow::new("branch");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("gate", "echo").with_config("handle", "left"));
    wf.add_node(NodeSpec::new("l", "echo"));
    wf.add_node(NodeSpec::new("r", "echo"));
    wf.add_node(NodeSpec::new("r2", "echo"));
    wf.connect("s", "gate");
    wf.connect_ports("gate", "left", "l", "");
    wf.connect_ports("gate", "right", "r", "");
    wf.connect("r", "r2");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert!(result.is_success());
    assert_eq!(result.node_status("l"), Some(NodeStatus::Completed));
    assert_eq!(result.node_status("r"), Some(NodeStatus::Skipped));
    assert_eq!(result.node_status("r2"), Some(NodeStatus::Skipped), "skips propagate");

    let events = drain(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter(|e| e.kind() == "node-started")
        .filter_map(|e| e.node_id())
        .collect();
    assert!(!started.contains(&"r"));
    assert_eq!(events.iter().filter(|e| e.kind() == "node-skipped").count(), 2);
}

#[tokio::test]
async fn test_unmatched_handle_follows_default_edges() {
    let rt = runtime(RuntimeConfig::default());
    let mut wf = Workflow::new("fallback");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("g", "echo").with_config("handle", "nowhere"));
    wf.add_node(NodeSpec::new("d", "echo"));
    wf.add_node(NodeSpec::new("x", "echo"));
    wf.connect("s", "g");
    wf.connect("g", "d");
    wf.connect_ports("g", "other", "x", "");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.node_status("d"), Some(NodeStatus::Completed));
    assert_eq!(result.node_status("x"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_node_failure_is_fail_fast() {
    let rt = runtime(RuntimeConfig::default());
    let mut rx = rt.subscribe_events();

    let mut wf = Workflow::new("fail");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("bad", "fail"));
    wf.add_node(NodeSpec::new("ok", "echo"));
    wf.add_node(NodeSpec::new("after", "echo"));
    wf.connect("s", "bad");
    wf.connect("s", "ok");
    wf.connect("ok", "after");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("execution_failed"));
    assert_eq!(result.node_status("bad"), Some(NodeStatus::Failed));
    assert_eq!(
        result.node_status("ok"),
        Some(NodeStatus::Completed),
        "level peers still finish"
    );
    assert!(result.node_results.get("after").is_none(), "later levels never start");

    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.kind()), Some("run-failed"));
    assert_eq!(events.iter().filter(|e| e.is_run_terminal()).count(), 1);
}

#[tokio::test]
async fn test_missing_executor_fails_node() {
    let rt = runtime(RuntimeConfig::default());
    let mut wf = Workflow::new("unknown");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("x", "does_not_exist"));
    wf.connect("s", "x");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.map(|e| e.kind()), Some("executor_not_found"));
}

#[tokio::test]
async fn test_panic_becomes_node_failure() {
    let rt = runtime(RuntimeConfig::default());
    let mut wf = Workflow::new("panic");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("p", "panic"));
    wf.connect("s", "p");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    let node = &result.node_results["p"];
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(matches!(node.error, Some(NodeError::Panicked(ref m)) if m.contains("executor bug")));
}

#[tokio::test]
async fn test_cycle_fails_before_any_node() {
    let rt = runtime(RuntimeConfig::default());
    let mut rx = rt.subscribe_events();

    let mut wf = Workflow::new("cycle");
    wf.add_node(NodeSpec::new("s", "start"));
    for id in ["a", "b", "c"] {
        wf.add_node(NodeSpec::new(id, "echo"));
    }
    wf.connect("s", "a");
    wf.connect("a", "b");
    wf.connect("b", "c");
    wf.connect("c", "a");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("cycle_detected"));
    assert!(result.node_results.is_empty());

    let events = drain(&mut rx);
    assert_eq!(kinds(&events).len(), 2);
    assert_eq!(events[1].kind(), "run-failed");
}

#[tokio::test]
async fn test_run_timeout_fails_run() {
    let rt = runtime(RuntimeConfig {
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let mut wf = Workflow::new("slow");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("z", "sleep").with_config("ms", 10_000i64));
    wf.add_node(NodeSpec::new("e", "end"));
    wf.connect("s", "z");
    wf.connect("z", "e");

    let started = std::time::Instant::now();
    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some("deadline_exceeded"));
    assert_eq!(result.node_status("z"), Some(NodeStatus::Skipped));
    assert_eq!(result.node_status("e"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_per_node_timeout() {
    let rt = runtime(RuntimeConfig::default());
    let mut wf = Workflow::new("node-timeout");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(
        NodeSpec::new("z", "sleep")
            .with_config("ms", 5_000i64)
            .with_config("timeout", 50i64),
    );
    wf.connect("s", "z");

    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.node_results["z"].error,
        Some(NodeError::Timeout { millis: 50 })
    );
}

#[tokio::test]
async fn test_caller_cancellation() {
    let rt = runtime(RuntimeConfig::default());
    let mut rx = rt.subscribe_events();
    let mut wf = Workflow::new("cancel");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("z", "sleep").with_config("ms", 10_000i64));
    wf.add_node(NodeSpec::new("e", "end"));
    wf.connect("s", "z");
    wf.connect("z", "e");

    let parent = tokio_util::sync::CancellationToken::new();
    let run_ctx = Arc::new(ExecutionContext::new("wf").with_parent_token(&parent));
    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = rt.execute(&wf, ValueMap::new(), run_ctx).await;
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.error.is_none(), "cancellation is not a failure");
    assert_eq!(result.node_status("e"), Some(NodeStatus::Skipped));

    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.kind()), Some("run-cancelled"));
    assert!(!events.iter().any(|e| e.kind() == "run-completed"));
}

#[tokio::test]
async fn test_registered_workflow_lookup() {
    let rt = runtime(RuntimeConfig::default());
    let mut wf = Workflow::new("stored");
    wf.add_node(NodeSpec::new("s", "start"));
    rt.register_workflow("wf-1", wf).await;

    let result = rt
        .execute_workflow("wf-1", ValueMap::new(), ctx())
        .await
        .expect("registered workflow runs");
    assert!(result.is_success());

    let missing = rt.execute_workflow("nope", ValueMap::new(), ctx()).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_event_handler_sees_whole_run() {
    let rt = runtime(RuntimeConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    rt.register_event_handler(Arc::new(move |e: &ExecutionEvent| {
        sink.lock().unwrap().push(e.kind().to_string())
    }));

    let mut wf = Workflow::new("handler");
    wf.add_node(NodeSpec::new("s", "start"));
    let result = rt.execute(&wf, ValueMap::new(), ctx()).await;
    assert!(result.is_success());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["run-started", "node-started", "node-completed", "run-completed"]
    );
}

fn flaky_workflow(node_type: &str, failures: i64, retries: i64) -> Workflow {
    let mut wf = Workflow::new("flaky");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(
        NodeSpec::new("f", node_type)
            .with_config("failures", failures)
            .with_config("retryCount", retries)
            .with_config("retryDelay", 5i64),
    );
    wf.connect("s", "f");
    wf
}

#[tokio::test]
async fn test_node_retry_count_retries_recoverable_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut rt = runtime(RuntimeConfig::default());
    rt.register_executor(Arc::new(Flaky {
        calls: calls.clone(),
        self_retrying: false,
    }));
    let mut rx = rt.subscribe_events();

    let result = rt.execute(&flaky_workflow("flaky", 2, 2), ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.node_results["f"].outputs.get("calls"), Some(&Value::from(3i64)));

    let warnings = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind() == "log" && e.node_id() == Some("f"))
        .count();
    assert_eq!(warnings, 2);
}

#[tokio::test]
async fn test_node_retry_count_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut rt = runtime(RuntimeConfig::default());
    rt.register_executor(Arc::new(Flaky {
        calls: calls.clone(),
        self_retrying: false,
    }));

    let result = rt.execute(&flaky_workflow("flaky", 5, 1), ValueMap::new(), ctx()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.error.map(|e| e.kind()), Some("validation_failure"));
}

#[tokio::test]
async fn test_self_retrying_executor_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut rt = runtime(RuntimeConfig::default());
    rt.register_executor(Arc::new(Flaky {
        calls: calls.clone(),
        self_retrying: true,
    }));

    let result = rt
        .execute(&flaky_workflow("flaky_wrapper", 1, 3), ValueMap::new(), ctx())
        .await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_wins_over_node_error() {
    let mut rt = runtime(RuntimeConfig::default());
    rt.register_executor(Arc::new(AbortsAsNetwork));
    let mut rx = rt.subscribe_events();

    let mut wf = Workflow::new("abort");
    wf.add_node(NodeSpec::new("s", "start"));
    wf.add_node(NodeSpec::new("a", "aborts"));
    wf.add_node(NodeSpec::new("e", "end"));
    wf.connect("s", "a");
    wf.connect("a", "e");

    let run_ctx = ctx();
    let canceller = run_ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let result = rt.execute(&wf, ValueMap::new(), run_ctx).await;
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.error.is_none());
    assert_eq!(result.node_status("a"), Some(NodeStatus::Failed));
    assert_eq!(result.node_status("e"), Some(NodeStatus::Skipped));

    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.kind()), Some("run-cancelled"));
    assert!(!events.iter().any(|e| e.kind() == "run-failed"));
}
