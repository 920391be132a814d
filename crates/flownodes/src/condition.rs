use crate::interpolate::{lookup, resolve_value};
use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};
use regex::Regex;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    RegexMatch,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    /// Accepts symbolic, kebab, snake and camel spellings.
    pub fn parse(raw: &str) -> Result<Self, NodeError> {
        let key: String = raw
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        let op = match key.as_str() {
            "==" | "=" | "===" | "eq" | "equals" | "equal" => Operator::Equals,
            "!=" | "!==" | "ne" | "neq" | "notequals" | "notequal" => Operator::NotEquals,
            ">" | "gt" | "greaterthan" => Operator::GreaterThan,
            ">=" | "gte" | "ge" | "greaterequal" | "greaterthanorequal" => Operator::GreaterEqual,
            "<" | "lt" | "lessthan" => Operator::LessThan,
            "<=" | "lte" | "le" | "lessequal" | "lessthanorequal" => Operator::LessEqual,
            "contains" => Operator::Contains,
            "notcontains" => Operator::NotContains,
            "startswith" => Operator::StartsWith,
            "endswith" => Operator::EndsWith,
            "matches" | "regex" | "regexmatch" => Operator::RegexMatch,
            "isempty" | "empty" => Operator::IsEmpty,
            "isnotempty" | "notempty" => Operator::IsNotEmpty,
            _ => {
                return Err(NodeError::Configuration(format!(
                    "Unknown condition operator: {}",
                    raw
                )))
            }
        };
        Ok(op)
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Operator::IsEmpty | Operator::IsNotEmpty)
    }
}

/// Evaluates `left <op> right`.
///
/// Ordering operators compare numerically when both sides parse as numbers
/// and fall back to string ordering otherwise.
pub fn evaluate(left: &Value, op: Operator, right: &Value) -> Result<bool, NodeError> {
    let l = left.to_display_string();
    let r = right.to_display_string();
    let result = match op {
        Operator::Equals => values_equal(left, right),
        Operator::NotEquals => !values_equal(left, right),
        Operator::GreaterThan => compare(left, right) == Ordering::Greater,
        Operator::GreaterEqual => compare(left, right) != Ordering::Less,
        Operator::LessThan => compare(left, right) == Ordering::Less,
        Operator::LessEqual => compare(left, right) != Ordering::Greater,
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::StartsWith => l.starts_with(&r),
        Operator::EndsWith => l.ends_with(&r),
        Operator::RegexMatch => Regex::new(&r)
            .map_err(|e| NodeError::Configuration(format!("Invalid regex '{}': {}", r, e)))?
            .is_match(&l),
        Operator::IsEmpty => left.is_empty(),
        Operator::IsNotEmpty => !left.is_empty(),
    };
    Ok(result)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Bool(a), b) | (b, Value::Bool(a)) if b.as_bool().is_some() => b.as_bool() == Some(*a),
        _ => left.to_display_string() == right.to_display_string(),
    }
}

fn compare(left: &Value, right: &Value) -> Ordering {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => left.to_display_string().cmp(&right.to_display_string()),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => map.contains_key(&needle.to_display_string()),
        other => other
            .to_display_string()
            .contains(&needle.to_display_string()),
    }
}

/// Routes execution by evaluating a comparison.
///
/// Three configurations, checked in order:
/// - `branches: [{handle, field, operator, value}]`: n-way, first match wins,
///   else `defaultHandle` (default `"default"`)
/// - `conditionGroups: [{logic, conditions: [{left, operator, right}]}]`:
///   groups are OR-ed, conditions inside a group use `logic` (`and`/`or`)
/// - `field`, `operator`, `value`
///
/// The two-way forms set the next handle to `"true"` or `"false"`.
pub struct ConditionNode;

impl ConditionNode {
    fn simple(&self, ctx: &NodeContext, spec: &ValueMap) -> Result<bool, NodeError> {
        let op = Operator::parse(&spec.get_string_or("operator", "equals"))?;
        let field = spec.get_string("field");
        if field.is_empty() {
            return Err(NodeError::Configuration("Missing config: field".to_string()));
        }

        let left = if field.contains("{{") {
            Some(resolve_value(&field, &ctx.inputs, &ctx.run)).filter(|v| {
                !matches!(v, Value::String(s) if s.contains("{{"))
            })
        } else {
            lookup(&field, &ctx.inputs, &ctx.run)
        };
        let left = match left {
            Some(value) => value,
            None if op.is_unary() => Value::Null,
            None => return Err(NodeError::MissingInput(field)),
        };

        if op.is_unary() {
            return evaluate(&left, op, &Value::Null);
        }
        let right = match spec.get("value") {
            Some(Value::String(s)) => resolve_value(s, &ctx.inputs, &ctx.run),
            Some(value) => value.clone(),
            None => return Err(NodeError::Configuration("Missing config: value".to_string())),
        };
        evaluate(&left, op, &right)
    }

    fn groups(&self, ctx: &NodeContext, groups: &[Value]) -> Result<bool, NodeError> {
        for group in groups.iter().filter_map(Value::as_object) {
            let any = group.get_string_or("logic", "and").eq_ignore_ascii_case("or");
            let conditions = group.get_array("conditions").cloned().unwrap_or_default();
            if conditions.is_empty() {
                continue;
            }

            let mut outcome = !any;
            for cond in conditions.iter().filter_map(Value::as_object) {
                let op = Operator::parse(&cond.get_string_or("operator", "equals"))?;
                let left = self.operand(ctx, cond.get("left"));
                let right = self.operand(ctx, cond.get("right"));
                let hit = evaluate(&left, op, &right)?;
                if any && hit {
                    outcome = true;
                    break;
                }
                if !any && !hit {
                    outcome = false;
                    break;
                }
            }
            if outcome {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn operand(&self, ctx: &NodeContext, raw: Option<&Value>) -> Value {
        match raw {
            Some(Value::String(s)) => resolve_value(s, &ctx.inputs, &ctx.run),
            Some(value) => value.clone(),
            None => Value::Null,
        }
    }
}

#[async_trait]
impl NodeExecutor for ConditionNode {
    fn node_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(branches) = ctx.config.get_array("branches").filter(|b| !b.is_empty()) {
            let default_handle = ctx.config.get_string_or("defaultHandle", "default");
            for (index, branch) in branches.iter().enumerate() {
                let Some(spec) = branch.as_object() else {
                    continue;
                };
                if self.simple(&ctx, spec)? {
                    let handle = spec.get_string_or("handle", &index.to_string());
                    ctx.events.info(format!("Branch '{}' selected", handle));
                    return Ok(NodeOutput::new()
                        .with_output("result", true)
                        .with_output("branch", handle.clone())
                        .with_output("matchedIndex", index)
                        .with_next_handle(handle));
                }
            }
            ctx.events.info(format!("No branch matched, using '{}'", default_handle));
            return Ok(NodeOutput::new()
                .with_output("result", false)
                .with_output("branch", default_handle.clone())
                .with_output("matchedIndex", -1i64)
                .with_next_handle(default_handle));
        }

        let result = match ctx.config.get_array("conditionGroups").filter(|g| !g.is_empty()) {
            Some(groups) => self.groups(&ctx, groups)?,
            None => self.simple(&ctx, &ctx.config)?,
        };

        let handle = if result { "true" } else { "false" };
        let mut branches = ValueMap::new();
        branches.insert("true".into(), Value::Bool(result));
        branches.insert("false".into(), Value::Bool(!result));

        Ok(NodeOutput::new()
            .with_output("result", result)
            .with_output("branch", handle)
            .with_output("branches", branches)
            .with_next_handle(handle))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("control", "Routes to the true/false (or named) branch")
            .output("result", "Whether the condition held")
            .output("branch", "Selected handle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_spellings_normalize() {
        assert_eq!(Operator::parse("not-equals").ok(), Some(Operator::NotEquals));
        assert_eq!(Operator::parse("greater_equal").ok(), Some(Operator::GreaterEqual));
        assert_eq!(Operator::parse("regex-match").ok(), Some(Operator::RegexMatch));
        assert_eq!(Operator::parse("isNotEmpty").ok(), Some(Operator::IsNotEmpty));
        assert!(Operator::parse("roughly").is_err());
    }

    #[test]
    fn numeric_comparison_falls_back_to_strings() {
        let ten = Value::Number(10.0);
        assert!(evaluate(&ten, Operator::GreaterThan, &Value::from("9")).unwrap());
        assert!(evaluate(&Value::from("b"), Operator::GreaterThan, &Value::from("a")).unwrap());
        assert!(evaluate(&Value::from("1"), Operator::Equals, &Value::Number(1.0)).unwrap());
    }

    #[test]
    fn contains_checks_arrays_and_strings() {
        let tags = Value::Array(vec![Value::from("x"), Value::from("y")]);
        assert!(evaluate(&tags, Operator::Contains, &Value::from("y")).unwrap());
        assert!(evaluate(&Value::from("hello"), Operator::Contains, &Value::from("ell")).unwrap());
        assert!(evaluate(&Value::from("abc123"), Operator::RegexMatch, &Value::from(r"\d+$")).unwrap());
    }
}
