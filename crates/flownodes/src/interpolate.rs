//! `{{path}}` placeholder resolution shared by the built-in executors.
//!
//! A path is looked up, in order, in:
//! 1. the node's resolved inputs (`name`, then `name.rest` as a dotted walk)
//! 2. another node's cached outputs (`nodeId.key...`)
//! 3. the run's global variables
//!
//! Unresolved placeholders are left in place.

use flowcore::{ExecutionContext, Value, ValueMap};
use regex::Regex;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"))
}

/// Replaces every `{{path}}` in `template`.
pub fn interpolate(template: &str, inputs: &ValueMap, run: &ExecutionContext) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps[1].trim();
            match lookup(path, inputs, run) {
                Some(value) => value.to_display_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Like [`interpolate`], but a string that is exactly one placeholder
/// yields the referenced value with its type intact.
pub fn resolve_value(expr: &str, inputs: &ValueMap, run: &ExecutionContext) -> Value {
    let trimmed = expr.trim();
    if let Some(caps) = placeholder().captures(trimmed) {
        if caps[0].len() == trimmed.len() {
            if let Some(value) = lookup(caps[1].trim(), inputs, run) {
                return value;
            }
        }
    }
    Value::String(interpolate(expr, inputs, run))
}

/// Interpolates string leaves of a value tree; other leaves are cloned.
pub fn interpolate_value(value: &Value, inputs: &ValueMap, run: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_value(s, inputs, run),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate_value(v, inputs, run))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, inputs, run)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn lookup(path: &str, inputs: &ValueMap, run: &ExecutionContext) -> Option<Value> {
    if let Some(value) = lookup_in(inputs, path) {
        return Some(value.clone());
    }

    if let Some((node_id, rest)) = path.split_once('.') {
        if let Some(outputs) = run.get_output(node_id) {
            if let Some(value) = lookup_in(&outputs, rest) {
                return Some(value.clone());
            }
        }
    }

    let variables = run.variables();
    lookup_in(&variables, path).cloned()
}

/// Exact key first, then a dotted walk from the first segment.
fn lookup_in<'a>(map: &'a ValueMap, path: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }
    let (head, rest) = path.split_once('.')?;
    map.get(head)?.lookup(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("name".into(), Value::from("ada"));
        map.insert("user".into(), Value::from(json!({"age": 36, "tags": ["x", "y"]})));
        map
    }

    #[test]
    fn replaces_inputs_outputs_and_variables() {
        let run = ExecutionContext::new("wf");
        let mut out = ValueMap::new();
        out.insert("text".into(), Value::from("hi"));
        run.set_output("n1", &out);
        run.set_variable("v", "city", Value::from("Paris"));

        let rendered = interpolate(
            "{{name}} is {{user.age}} ({{user.tags.1}}), {{n1.text}} from {{city}} {{nope}}",
            &inputs(),
            &run,
        );
        assert_eq!(rendered, "ada is 36 (y), hi from Paris {{nope}}");
    }

    #[test]
    fn pure_placeholder_keeps_type() {
        let run = ExecutionContext::new("wf");
        assert_eq!(resolve_value("{{user.age}}", &inputs(), &run), Value::Number(36.0));
        assert_eq!(
            resolve_value("age {{user.age}}", &inputs(), &run),
            Value::from("age 36")
        );
    }
}
