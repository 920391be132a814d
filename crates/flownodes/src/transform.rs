use crate::condition::{evaluate, Operator};
use crate::interpolate::{lookup, resolve_value};
use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};

/// Value a transform reads: `config.field` (path or template), else the
/// first of `inputs.input|data|value|text`.
fn source_value(ctx: &NodeContext) -> Result<Value, NodeError> {
    if let Some(field) = ctx.config.get_str("field").filter(|f| !f.is_empty()) {
        if field.contains("{{") {
            return Ok(resolve_value(field, &ctx.inputs, &ctx.run));
        }
        return lookup(field, &ctx.inputs, &ctx.run)
            .ok_or_else(|| NodeError::MissingInput(field.to_string()));
    }
    ["input", "data", "value", "text"]
        .iter()
        .find_map(|key| ctx.inputs.get(*key).cloned())
        .ok_or_else(|| NodeError::MissingInput("input".to_string()))
}

fn expect_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, NodeError> {
    value.as_str().ok_or_else(|| NodeError::InvalidInputType {
        field: field.to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })
}

/// Reshapes data.
///
/// `operation` selects one of `mappings` (default), `json_parse`,
/// `json_stringify`, `uppercase`, `lowercase`, `trim`, `pick`.
pub struct TransformNode;

#[async_trait]
impl NodeExecutor for TransformNode {
    fn node_type(&self) -> &str {
        "transform"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let operation = ctx.config.get_string_or("operation", "mappings");

        if operation == "mappings" {
            let mappings = ctx
                .config
                .get_object("mappings")
                .ok_or_else(|| NodeError::Configuration("Missing config: mappings".to_string()))?;
            let mut result = ValueMap::new();
            for (key, source) in mappings {
                let value = match source {
                    Value::String(s) if s.contains("{{") => resolve_value(s, &ctx.inputs, &ctx.run),
                    Value::String(s) => lookup(s, &ctx.inputs, &ctx.run).unwrap_or_default(),
                    other => other.clone(),
                };
                result.insert(key.clone(), value);
            }
            let mut output = NodeOutput::from_map(result.clone());
            output.outputs.insert("result".into(), Value::Object(result));
            return Ok(output);
        }

        let input = source_value(&ctx)?;
        let result = match operation.as_str() {
            "json_parse" => {
                let text = expect_str(&input, "json")?;
                serde_json::from_str::<serde_json::Value>(text)
                    .map(Value::from)
                    .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?
            }
            "json_stringify" => {
                let json = input.to_json();
                let text = if ctx.config.get_bool("pretty") {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                Value::String(text.map_err(|e| {
                    NodeError::ExecutionFailed(format!("JSON stringify error: {}", e))
                })?)
            }
            "uppercase" => Value::String(input.to_display_string().to_uppercase()),
            "lowercase" => Value::String(input.to_display_string().to_lowercase()),
            "trim" => Value::String(input.to_display_string().trim().to_string()),
            "pick" => {
                let object = input.as_object().ok_or_else(|| NodeError::InvalidInputType {
                    field: "input".to_string(),
                    expected: "object".to_string(),
                    actual: input.type_name().to_string(),
                })?;
                let fields = ctx
                    .config
                    .get_array("fields")
                    .ok_or_else(|| NodeError::Configuration("Missing config: fields".to_string()))?;
                let picked: ValueMap = fields
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|f| object.get(f).map(|v| (f.to_string(), v.clone())))
                    .collect();
                Value::Object(picked)
            }
            other => {
                return Err(NodeError::Configuration(format!(
                    "Unknown transform operation: {}",
                    other
                )))
            }
        };

        Ok(NodeOutput::new().with_output("result", result))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("transform", "Maps, parses, stringifies or reshapes data")
            .input("input", "Value to transform", false)
            .output("result", "Transformed value")
    }
}

/// Merges objects.
///
/// Config `sources`: list of paths/templates to merge in order. Without it,
/// every predecessor's outputs are merged in predecessor order. `deep: true`
/// merges nested objects recursively.
pub struct MergeNode;

#[async_trait]
impl NodeExecutor for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let deep = ctx.config.get_bool("deep");
        let sources: Vec<Value> = match ctx.config.get_array("sources") {
            Some(paths) => paths
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|p| {
                    if p.contains("{{") {
                        Some(resolve_value(p, &ctx.inputs, &ctx.run))
                    } else {
                        lookup(p, &ctx.inputs, &ctx.run)
                    }
                })
                .collect(),
            None => ctx
                .predecessors
                .iter()
                .filter_map(|p| ctx.inputs.get(p).cloned())
                .collect(),
        };

        let mut merged = ValueMap::new();
        for source in sources {
            if let Value::Object(map) = source {
                merge_into(&mut merged, map, deep);
            }
        }

        Ok(NodeOutput::new()
            .with_output("count", merged.len())
            .with_output("result", merged))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("transform", "Merges several objects into one")
            .output("result", "Merged object")
    }
}

fn merge_into(target: &mut ValueMap, source: ValueMap, deep: bool) {
    for (key, value) in source {
        if deep {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (target.get_mut(&key), &value)
            {
                merge_into(existing, incoming.clone(), deep);
                continue;
            }
        }
        target.insert(key, value);
    }
}

/// Keeps the items of an array that satisfy a condition.
///
/// Config: `items` (path, template or literal), `condition: {field,
/// operator, value}` where `field` is a path inside each item (empty for
/// the item itself).
pub struct FilterNode;

#[async_trait]
impl NodeExecutor for FilterNode {
    fn node_type(&self) -> &str {
        "filter"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = match ctx.config.get("items") {
            Some(Value::String(p)) if p.contains("{{") => resolve_value(p, &ctx.inputs, &ctx.run),
            Some(Value::String(p)) => lookup(p, &ctx.inputs, &ctx.run)
                .ok_or_else(|| NodeError::MissingInput(p.clone()))?,
            Some(other) => other.clone(),
            None => ctx.require_input("items")?.clone(),
        };
        let Value::Array(items) = items else {
            return Err(NodeError::InvalidInputType {
                field: "items".to_string(),
                expected: "array".to_string(),
                actual: items.type_name().to_string(),
            });
        };

        let cond = ctx
            .config
            .get_object("condition")
            .ok_or_else(|| NodeError::Configuration("Missing config: condition".to_string()))?;
        let op = Operator::parse(&cond.get_string_or("operator", "equals"))?;
        let field = cond.get_string("field");
        let right = match cond.get("value") {
            Some(Value::String(s)) => resolve_value(s, &ctx.inputs, &ctx.run),
            Some(v) => v.clone(),
            None => Value::Null,
        };

        let total = items.len();
        let mut kept = Vec::new();
        for item in items {
            let left = if field.is_empty() {
                item.clone()
            } else {
                item.lookup(&field).cloned().unwrap_or_default()
            };
            if evaluate(&left, op, &right)? {
                kept.push(item);
            }
        }

        Ok(NodeOutput::new()
            .with_output("count", kept.len())
            .with_output("removed", total - kept.len())
            .with_output("result", kept))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("transform", "Filters an array by a condition")
            .input("items", "Array to filter", false)
            .output("result", "Items that matched")
    }
}
