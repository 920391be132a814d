use async_trait::async_trait;
use flowcore::{ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput};
use rand::Rng;
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
///
/// Config: `mode` = `fixed` (default, uses `duration`) or `random`
/// (uniform in `[minDuration, maxDuration]`). Durations are in `unit`
/// (`ms` default, `s`, `m`). Inputs pass through.
pub struct DelayNode;

fn to_millis(amount: f64, unit: &str) -> Result<f64, NodeError> {
    let factor = match unit {
        "ms" | "milliseconds" => 1.0,
        "s" | "sec" | "seconds" => 1_000.0,
        "m" | "min" | "minutes" => 60_000.0,
        other => {
            return Err(NodeError::Configuration(format!(
                "Unknown delay unit: {}",
                other
            )))
        }
    };
    if amount < 0.0 {
        return Err(NodeError::Configuration(format!(
            "Delay duration must not be negative: {}",
            amount
        )));
    }
    Ok(amount * factor)
}

#[async_trait]
impl NodeExecutor for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let unit = ctx.config.get_string_or("unit", "ms").to_ascii_lowercase();
        let mode = ctx.config.get_string_or("mode", "fixed").to_ascii_lowercase();

        let delay_ms: f64 = match mode.as_str() {
            "fixed" => to_millis(ctx.config.get_f64_or("duration", 1000.0), &unit)?,
            "random" | "random-between" | "random_between" => {
                let raw_min = ctx.config.get_f64_or("minDuration", 0.0);
                let min = to_millis(raw_min, &unit)?;
                let max = to_millis(ctx.config.get_f64_or("maxDuration", raw_min), &unit)?;
                if max < min {
                    return Err(NodeError::Configuration(format!(
                        "maxDuration ({}) is below minDuration ({})",
                        max, min
                    )));
                }
                if max > min {
                    rand::thread_rng().gen_range(min..=max)
                } else {
                    min
                }
            }
            other => {
                return Err(NodeError::Configuration(format!(
                    "Unknown delay mode: {}",
                    other
                )))
            }
        };
        let delay_ms = delay_ms as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {
                Ok(NodeOutput::from_map(ctx.inputs.clone()).with_output("delayedMs", delay_ms))
            }
        }
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("time", "Pauses for a fixed or random duration")
            .output("delayedMs", "Milliseconds waited")
    }
}
