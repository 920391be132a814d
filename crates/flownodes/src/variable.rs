use crate::interpolate::interpolate_value;
use async_trait::async_trait;
use flowcore::{ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value};

/// Sets global variables and echoes them as outputs.
///
/// `config.variables` is either a map (`{"n": 42, "greet": "hi {{name}}"}`)
/// or a list of `{name, value, type}` where `type` is one of
/// `string|number|boolean|json`.
pub struct VariableNode;

#[async_trait]
impl NodeExecutor for VariableNode {
    fn node_type(&self) -> &str {
        "variable"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();

        match ctx.config.get("variables") {
            Some(Value::Object(vars)) => {
                let mut names: Vec<&String> = vars.keys().collect();
                names.sort();
                for name in names {
                    let value = interpolate_value(&vars[name], &ctx.inputs, &ctx.run);
                    ctx.run.set_variable(ctx.node_id(), name, value.clone());
                    output = output.with_output(name.clone(), value);
                }
            }
            Some(Value::Array(items)) => {
                for item in items {
                    let Some(spec) = item.as_object() else {
                        continue;
                    };
                    let name = spec.get_string("name");
                    if name.is_empty() {
                        continue;
                    }
                    let raw = spec.get("value").cloned().unwrap_or_default();
                    let value = interpolate_value(&raw, &ctx.inputs, &ctx.run);
                    let value = convert(value, &spec.get_string_or("type", "string"))?;
                    ctx.run.set_variable(ctx.node_id(), &name, value.clone());
                    output = output.with_output(name, value);
                }
            }
            Some(other) => {
                return Err(NodeError::InvalidInputType {
                    field: "variables".to_string(),
                    expected: "object or array".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
            None => {}
        }

        Ok(output)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("data", "Sets workflow variables").output("*", "One output per variable")
    }
}

fn convert(value: Value, target: &str) -> Result<Value, NodeError> {
    let converted = match target {
        "number" => match &value {
            Value::Number(_) => value,
            other => Value::Number(other.as_f64().ok_or_else(|| {
                NodeError::InvalidInputType {
                    field: "value".to_string(),
                    expected: "number".to_string(),
                    actual: other.to_display_string(),
                }
            })?),
        },
        "boolean" | "bool" => match &value {
            Value::Bool(_) => value,
            Value::String(s) => Value::Bool(matches!(s.trim(), "true" | "1" | "yes")),
            other => Value::Bool(other.is_truthy()),
        },
        "json" | "object" | "array" => match &value {
            Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                .map(Value::from)
                .map_err(|e| NodeError::InvalidInputType {
                    field: "value".to_string(),
                    expected: "json".to_string(),
                    actual: e.to_string(),
                })?,
            _ => value,
        },
        "string" => match &value {
            Value::String(_) => value,
            other => Value::String(other.to_display_string()),
        },
        _ => value,
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_declared_types() {
        assert_eq!(convert(Value::from("42"), "number").ok(), Some(Value::Number(42.0)));
        assert_eq!(convert(Value::from("yes"), "boolean").ok(), Some(Value::Bool(true)));
        assert_eq!(convert(Value::Number(3.0), "string").ok(), Some(Value::from("3")));
        assert!(convert(Value::from("abc"), "number").is_err());
    }
}
