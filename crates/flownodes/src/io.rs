use crate::interpolate::{interpolate_value, resolve_value};
use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
    END_NODE_TYPE, START_NODE_TYPE,
};

/// Entry point of every workflow. Echoes the run's initial inputs.
pub struct StartNode;

#[async_trait]
impl NodeExecutor for StartNode {
    fn node_type(&self) -> &str {
        START_NODE_TYPE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::from_map(ctx.inputs))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("io", "Workflow entry point; passes the initial inputs through")
    }
}

/// Terminal node. Its outputs become the run outputs.
pub struct EndNode;

#[async_trait]
impl NodeExecutor for EndNode {
    fn node_type(&self) -> &str {
        END_NODE_TYPE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::from_map(ctx.inputs))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("io", "Workflow exit; its inputs become the run outputs")
    }
}

/// Reads named fields from the inputs (or trigger data), applying defaults.
///
/// Config: `fields: [{name, default, required}]`. Without `fields` the
/// inputs are passed through.
pub struct InputNode;

#[async_trait]
impl NodeExecutor for InputNode {
    fn node_type(&self) -> &str {
        "input"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let Some(fields) = ctx.config.get_array("fields") else {
            return Ok(NodeOutput::from_map(ctx.inputs));
        };

        let trigger = ctx.run.trigger_data();
        let mut outputs = ValueMap::new();
        for field in fields {
            let name = match field {
                Value::String(name) => name.clone(),
                Value::Object(spec) => spec.get_string("name"),
                _ => continue,
            };
            if name.is_empty() {
                continue;
            }
            let spec = field.as_object();
            let value = ctx
                .inputs
                .get(&name)
                .or_else(|| trigger.get(&name))
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| spec.and_then(|s| s.get("default")).cloned());

            match value {
                Some(value) => {
                    outputs.insert(name, value);
                }
                None if spec.map(|s| s.get_bool("required")).unwrap_or(false) => {
                    return Err(NodeError::MissingInput(name));
                }
                None => {
                    outputs.insert(name, Value::Null);
                }
            }
        }
        Ok(NodeOutput::from_map(outputs))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("io", "Collects named input fields with defaults")
    }
}

/// Presents a value to the caller; collected into the run's `output_schema`.
///
/// Config: `value` (template or `{{path}}`), `title`, `outputType`,
/// `showTimestamp`. Without `value`, `inputs.output` / `inputs.value` is used.
pub struct OutputNode;

#[async_trait]
impl NodeExecutor for OutputNode {
    fn node_type(&self) -> &str {
        "output"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = match ctx.config.get("value") {
            Some(template) => interpolate_value(template, &ctx.inputs, &ctx.run),
            None => ctx
                .inputs
                .get("output")
                .or_else(|| ctx.inputs.get("value"))
                .cloned()
                .unwrap_or_default(),
        };
        let title = match ctx.config.get_str("title") {
            Some(title) => resolve_value(title, &ctx.inputs, &ctx.run),
            None => Value::from(ctx.node.display_name()),
        };
        let output_type = ctx
            .config
            .get_string_or("outputType", &ctx.config.get_string_or("type", "text"));

        Ok(NodeOutput::new()
            .with_output("output", value.clone())
            .with_output("value", value)
            .with_output("title", title)
            .with_output("type", output_type)
            .with_output("showTimestamp", ctx.config.get_bool("showTimestamp")))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("io", "Publishes a value to the run's output schema")
            .input("value", "Value to present when not configured", false)
            .output("output", "The presented value")
    }
}
