use async_trait::async_trait;
use flowcore::{
    ConfigExt, LogEntry, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput,
    NodeSpec, Value, ValueMap,
};
use std::time::Duration;
use tracing::{debug, warn};

const ERROR_HANDLE: &str = "error";

/// Wraps another executor with retries and optional error absorption.
///
/// Config:
/// - `nodeType` + `nodeConfig`: the wrapped executor and its config
///   (alternatively `wrappedNodeId` names a node of the workflow to borrow)
/// - `retryCount` (default 0): extra attempts after the first
/// - `retryDelayMs` (default 0): wait between attempts
/// - `continueOnError`: on final failure, succeed with `fallbackValue`
///   on the `error` handle instead of failing
/// - `errorVariable` (default `error`): variable receiving the failure
///
/// Every recoverable error is retried up to `retryCount` times.
/// Cancellation and unsafe operations always propagate.
pub struct TryCatchNode;

impl TryCatchNode {
    fn wrapped(&self, ctx: &NodeContext) -> Result<NodeSpec, NodeError> {
        if let Some(id) = ctx.config.get_str("wrappedNodeId").filter(|s| !s.is_empty()) {
            let mut spec = ctx
                .workflow
                .find_node(id)
                .cloned()
                .ok_or_else(|| NodeError::Configuration(format!("Unknown wrapped node: {}", id)))?;
            spec.id = ctx.node.id.clone();
            return Ok(spec);
        }

        let node_type = ctx.require_config_str("nodeType")?;
        let mut spec = NodeSpec::new(ctx.node.id.clone(), node_type);
        spec.label = ctx.node.label.clone();
        spec.config = ctx.config.get_object("nodeConfig").cloned().unwrap_or_default();
        Ok(spec)
    }

    async fn pause(&self, ctx: &NodeContext, delay: Duration) -> Result<(), NodeError> {
        if delay.is_zero() {
            return ctx.ensure_not_cancelled();
        }
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl NodeExecutor for TryCatchNode {
    fn node_type(&self) -> &str {
        "try_catch"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let spec = self.wrapped(&ctx)?;
        if spec.node_type == self.node_type() {
            return Err(NodeError::Configuration(
                "try_catch cannot wrap itself".to_string(),
            ));
        }
        let inner = ctx
            .executors
            .executor(&spec.node_type)
            .ok_or_else(|| NodeError::ExecutorNotFound(spec.node_type.clone()))?;

        let retries = ctx.config.get_i64_or("retryCount", 0).max(0) as u32;
        let delay = Duration::from_millis(ctx.config.get_i64_or("retryDelayMs", 0).max(0) as u64);

        let mut attempt = 0u32;
        let error = loop {
            attempt += 1;
            ctx.ensure_not_cancelled()?;

            match inner.execute(ctx.derive(spec.clone(), ctx.inputs.clone())).await {
                Ok(output) => {
                    debug!(node_id = %ctx.node.id, attempt, "Wrapped node succeeded");
                    return Ok(output.with_log(LogEntry::info(format!(
                        "succeeded on attempt {}",
                        attempt
                    ))));
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) if attempt <= retries => {
                    warn!(node_id = %ctx.node.id, attempt, error = %e, "Attempt failed, retrying");
                    ctx.events.warn(format!("Attempt {} failed: {}", attempt, e));
                    self.pause(&ctx, delay).await?;
                }
                Err(e) => break e,
            }
        };

        if !ctx.config.get_bool("continueOnError") {
            return Err(error);
        }

        let variable = ctx.config.get_string_or("errorVariable", "error");
        let mut record = ValueMap::new();
        record.insert("kind".into(), Value::from(error.kind()));
        record.insert("message".into(), Value::from(error.to_string()));
        record.insert("attempts".into(), Value::from(attempt as i64));
        ctx.run.set_variable(ctx.node_id(), &variable, Value::Object(record.clone()));
        ctx.events.warn(format!("Continuing after error: {}", error));

        let fallback = ctx.config.get("fallbackValue").cloned().unwrap_or_default();
        Ok(NodeOutput::new()
            .with_output("result", fallback.clone())
            .with_output("output", fallback)
            .with_output(variable, record)
            .with_log(LogEntry::warn(format!("absorbed error after {} attempts: {}", attempt, error)))
            .with_next_handle(ERROR_HANDLE))
    }

    fn handles_retries(&self) -> bool {
        true
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("control", "Retries a wrapped node and optionally absorbs its failure")
            .output("result", "Wrapped outputs, or the fallback value")
    }
}
