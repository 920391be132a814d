// crates/flowcore/tests/context_events_test.rs

use async_trait::async_trait;
use flowcore::adapters::{AdapterError, AuditEvent, AuditSink};
use flowcore::{EventBus, EventHandler, ExecutionContext, ExecutionEvent, Value, ValueMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn run_started(id: &str) -> ExecutionEvent {
    ExecutionEvent::RunStarted {
        execution_id: id.to_string(),
        workflow_id: "wf".to_string(),
        total_nodes: 1,
        timestamp: chrono::Utc::now(),
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AdapterError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl AuditSink for FailingSink {
    async fn record(&self, _event: AuditEvent) -> Result<(), AdapterError> {
        Err(AdapterError::fatal("storage offline"))
    }
}

#[tokio::test]
async fn test_outputs_are_snapshots() {
    let ctx = ExecutionContext::new("wf");
    let mut outputs = ValueMap::new();
    outputs.insert("a".to_string(), Value::from(1i64));
    ctx.set_output("n1", &outputs);

    outputs.insert("b".to_string(), Value::from(2i64));
    let stored = ctx.get_output("n1").expect("output should be stored");
    assert_eq!(stored.len(), 1, "later mutation must not leak into the cache");

    let mut copy = ctx.get_output("n1").unwrap();
    copy.clear();
    assert_eq!(ctx.get_output("n1").unwrap().len(), 1, "reads return copies");
}

#[tokio::test]
async fn test_variables_overwrite_and_log() {
    let ctx = ExecutionContext::new("wf");
    ctx.set_variable("v1", "count", Value::from(1i64));
    ctx.set_variable("v2", "count", Value::from(2i64));

    assert_eq!(ctx.get_variable("count"), Some(Value::Number(2.0)));
    let logs = ctx.take_variable_logs("v1");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].message.contains("count"));
    assert!(ctx.take_variable_logs("v1").is_empty(), "logs are drained once");
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_monotonic() {
    let ctx = Arc::new(ExecutionContext::new("wf"));
    assert!(!ctx.is_cancelled());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancel() })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    assert!(ctx.is_cancelled());
    ctx.cancel();
    assert!(ctx.is_cancelled(), "cancellation never reverts");
    tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
        .await
        .expect("cancelled() resolves after cancel");
}

#[tokio::test]
async fn test_parent_token_cancels_run() {
    let parent = tokio_util::sync::CancellationToken::new();
    let ctx = ExecutionContext::new("wf").with_parent_token(&parent);
    parent.cancel();
    assert!(ctx.is_cancelled());
}

#[tokio::test]
async fn test_record_audit_fills_identity() {
    let sink = Arc::new(RecordingSink::default());
    let ctx = ExecutionContext::new("wf-1")
        .with_user("u-1")
        .with_workspace("ws-1")
        .with_audit_sink(sink.clone());

    ctx.record_audit(AuditEvent::new("data_written").with_node("db"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].workflow_id, "wf-1");
    assert_eq!(events[0].workspace_id, "ws-1");
    assert_eq!(events[0].execution_id, ctx.execution_id());
}

#[tokio::test]
async fn test_audit_failure_does_not_propagate() {
    init_tracing();
    let ctx = ExecutionContext::new("wf").with_audit_sink(Arc::new(FailingSink));
    ctx.record_audit(AuditEvent::new("data_written"));
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_every_handler_receives_every_event() {
    let bus = EventBus::new(16);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let sink = first.clone();
    bus.register_handler(Arc::new(move |e: &ExecutionEvent| {
        sink.lock().unwrap().push(e.execution_id().to_string())
    }));
    let sink = second.clone();
    bus.register_handler(Arc::new(move |e: &ExecutionEvent| {
        sink.lock().unwrap().push(e.execution_id().to_string())
    }));

    for i in 0..5 {
        bus.emit(run_started(&i.to_string()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let expected: Vec<String> = (0..5).map(|i| i.to_string()).collect();
    assert_eq!(*first.lock().unwrap(), expected);
    assert_eq!(*second.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_slow_handler_drops_oldest_without_blocking() {
    init_tracing();
    let bus = EventBus::new(4);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register_handler(Arc::new(move |e: &ExecutionEvent| {
        std::thread::sleep(Duration::from_millis(20));
        sink.lock().unwrap().push(e.execution_id().to_string())
    }));

    let started = std::time::Instant::now();
    for i in 0..50 {
        bus.emit(run_started(&i.to_string()));
    }
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "emit must not wait for handlers"
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    let seen = seen.lock().unwrap();
    assert!(seen.len() < 50, "overflow drops events");
    assert_eq!(seen.last().map(String::as_str), Some("49"), "newest events survive");
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    init_tracing();
    let bus = EventBus::new(8);
    let seen = Arc::new(Mutex::new(0usize));
    bus.register_handler(Arc::new(|_: &ExecutionEvent| panic!("handler bug")));
    let sink = seen.clone();
    bus.register_handler(Arc::new(move |_: &ExecutionEvent| *sink.lock().unwrap() += 1));

    bus.emit(run_started("a"));
    bus.emit(run_started("b"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_subscribe_sees_events_in_order() {
    let bus = EventBus::new(8);
    let mut rx = bus.subscribe();
    bus.emit(run_started("x"));
    bus.emit(run_started("y"));
    assert_eq!(rx.recv().await.unwrap().execution_id(), "x");
    assert_eq!(rx.recv().await.unwrap().execution_id(), "y");
}

#[test]
fn test_event_kind_names() {
    let event = run_started("r");
    assert_eq!(event.kind(), "run-started");
    assert!(!event.is_run_terminal());
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "run_started");
}

fn _assert_handler_object_safe(_: &dyn EventHandler) {}
