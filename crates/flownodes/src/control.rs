use crate::condition::{evaluate, Operator};
use crate::interpolate::{lookup, resolve_value};
use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, NodeSpec, Value,
    ValueMap,
};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MAX_ITERATIONS: i64 = 1000;
const BODY_HANDLE: &str = "body";
const DONE_HANDLE: &str = "done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopType {
    ForEach,
    Count,
    While,
}

impl LoopType {
    fn parse(raw: &str) -> Result<Self, NodeError> {
        match raw.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "foreach" | "" => Ok(LoopType::ForEach),
            "count" | "times" => Ok(LoopType::Count),
            "while" => Ok(LoopType::While),
            other => Err(NodeError::Configuration(format!("Unknown loop type: {}", other))),
        }
    }
}

/// Runs a body node inline once per iteration.
///
/// Config:
/// - `loopType`: `forEach` (default), `count` or `while`
/// - `items` / `itemsKey`: the iterable for `forEach` (template, path or literal array)
/// - `count`: iterations for `count`
/// - `condition: {field, operator, value}`: checked before each `while` iteration
/// - `bodyNodeId`: body node; defaults to the target of the out-edge on the `body` handle
/// - `maxIterations`: hard cap, default 1000
///
/// The body sees `item`, `index`, `iteration` and `previous` on top of the
/// loop's own inputs. Downstream routing continues on the `done` handle.
pub struct LoopNode;

impl LoopNode {
    fn body_node(&self, ctx: &NodeContext) -> Option<NodeSpec> {
        let id = match ctx.config.get_str("bodyNodeId").filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => ctx
                .workflow
                .edges
                .iter()
                .find(|e| e.source == ctx.node.id && e.source_handle == BODY_HANDLE)
                .map(|e| e.target.clone())?,
        };
        ctx.workflow.find_node(&id).cloned()
    }

    fn items(&self, ctx: &NodeContext) -> Result<Vec<Value>, NodeError> {
        let raw = ctx
            .config
            .get("items")
            .or_else(|| ctx.config.get("itemsKey"))
            .cloned();
        let value = match raw {
            Some(Value::String(path)) if path.contains("{{") => {
                resolve_value(&path, &ctx.inputs, &ctx.run)
            }
            Some(Value::String(path)) => lookup(&path, &ctx.inputs, &ctx.run)
                .ok_or_else(|| NodeError::MissingInput(path.clone()))?,
            Some(other) => other,
            None => ctx.require_input("items")?.clone(),
        };
        match value {
            Value::Array(items) => Ok(items),
            Value::String(s) => serde_json::from_str::<serde_json::Value>(&s)
                .ok()
                .and_then(|json| Value::from(json).as_array().cloned())
                .ok_or_else(|| invalid_items(&Value::String(s))),
            other => Err(invalid_items(&other)),
        }
    }

    fn keep_going(&self, ctx: &NodeContext, scope: &ValueMap) -> Result<bool, NodeError> {
        let Some(cond) = ctx.config.get_object("condition") else {
            return Err(NodeError::Configuration(
                "Missing config: condition".to_string(),
            ));
        };
        let op = Operator::parse(&cond.get_string_or("operator", "equals"))?;
        let field = cond.get_string("field");
        let left = lookup(&field, scope, &ctx.run).unwrap_or_default();
        let right = match cond.get("value") {
            Some(Value::String(s)) => resolve_value(s, scope, &ctx.run),
            Some(v) => v.clone(),
            None => Value::Null,
        };
        evaluate(&left, op, &right)
    }

    async fn run_body(
        &self,
        ctx: &NodeContext,
        body: Option<&(NodeSpec, Arc<dyn NodeExecutor>)>,
        scope: ValueMap,
        item: &Value,
    ) -> Result<Value, NodeError> {
        let Some((spec, executor)) = body else {
            return Ok(item.clone());
        };
        let output = executor.execute(ctx.derive(spec.clone(), scope)).await?;
        Ok(Value::Object(output.outputs))
    }
}

fn invalid_items(value: &Value) -> NodeError {
    NodeError::InvalidInputType {
        field: "items".to_string(),
        expected: "array".to_string(),
        actual: value.type_name().to_string(),
    }
}

#[async_trait]
impl NodeExecutor for LoopNode {
    fn node_type(&self) -> &str {
        "loop"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let loop_type = LoopType::parse(&ctx.config.get_string("loopType"))?;
        let max = ctx.config.get_i64_or("maxIterations", DEFAULT_MAX_ITERATIONS).max(1) as usize;

        let body = match self.body_node(&ctx) {
            Some(spec) => {
                let executor = ctx
                    .executors
                    .executor(&spec.node_type)
                    .ok_or_else(|| NodeError::ExecutorNotFound(spec.node_type.clone()))?;
                Some((spec, executor))
            }
            None => None,
        };

        let planned: Option<Vec<Value>> = match loop_type {
            LoopType::ForEach => Some(self.items(&ctx)?),
            LoopType::Count => {
                let count = ctx.config.get_i64_or("count", 0).max(0) as usize;
                Some((0..count).map(Value::from).collect())
            }
            LoopType::While => None,
        };
        if let Some(items) = &planned {
            if items.len() > max {
                return Err(NodeError::IterationLimit { max });
            }
        }

        let mut results = Vec::new();
        let mut previous = Value::Null;
        let mut index = 0usize;
        loop {
            ctx.ensure_not_cancelled()?;

            let item = match &planned {
                Some(items) => match items.get(index) {
                    Some(item) => item.clone(),
                    None => break,
                },
                None => Value::from(index),
            };

            let mut scope = ctx.inputs.clone();
            scope.insert("item".into(), item.clone());
            scope.insert("index".into(), Value::from(index));
            scope.insert("iteration".into(), Value::from(index + 1));
            scope.insert("previous".into(), previous.clone());

            if loop_type == LoopType::While {
                if !self.keep_going(&ctx, &scope)? {
                    break;
                }
                if index >= max {
                    return Err(NodeError::IterationLimit { max });
                }
            }

            debug!(node_id = %ctx.node.id, index, "Loop iteration");
            previous = self.run_body(&ctx, body.as_ref(), scope, &item).await?;
            results.push(previous.clone());
            index += 1;
        }

        ctx.events.info(format!("Loop finished after {} iterations", index));
        Ok(NodeOutput::new()
            .with_output("count", results.len())
            .with_output("results", results)
            .with_output("completed", true)
            .with_next_handle(DONE_HANDLE))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("control", "Runs a body node for each item, N times, or while a condition holds")
            .input("items", "Iterable for forEach loops", false)
            .output("results", "Body outputs, one per iteration")
            .output("count", "Iterations run")
    }
}

/// Fans out into N branch tokens, `branch-0` .. `branch-{N-1}`.
///
/// Config: `branches` (number, or a list whose length is used), default 2.
pub struct ParallelNode;

#[async_trait]
impl NodeExecutor for ParallelNode {
    fn node_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let degree = match ctx.config.get("branches") {
            Some(Value::Array(list)) => list.len(),
            _ => ctx.config.get_i64_or("branches", 2).max(1) as usize,
        };

        let mut output = NodeOutput::new().with_output("branches", degree);
        for index in 0..degree {
            let mut token = ValueMap::new();
            token.insert("index".into(), Value::from(index));
            token.insert("branch".into(), Value::from(branch_key(index)));
            output = output.with_output(branch_key(index), token);
        }
        Ok(output)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("control", "Fans out into parallel branches")
            .output("branch-N", "One token per branch")
    }
}

/// Collects the outputs of every predecessor that ran.
///
/// Outputs `branch-i` for the i-th predecessor (sorted by id), `merged`
/// (union of all predecessor outputs, later branches winning), `results`
/// and `count`.
pub struct ParallelJoinNode;

#[async_trait]
impl NodeExecutor for ParallelJoinNode {
    fn node_type(&self) -> &str {
        "parallel_join"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        let mut merged = ValueMap::new();
        let mut results = Vec::new();

        for pred in &ctx.predecessors {
            let outputs = match ctx.inputs.get(pred).and_then(Value::as_object) {
                Some(outputs) => outputs.clone(),
                None => match ctx.run.get_output(pred) {
                    Some(outputs) => outputs,
                    None => continue,
                },
            };
            for (k, v) in &outputs {
                merged.insert(k.clone(), v.clone());
            }
            output = output.with_output(branch_key(results.len()), outputs.clone());
            results.push(Value::Object(outputs));
        }

        Ok(output
            .with_output("count", results.len())
            .with_output("merged", merged)
            .with_output("results", results))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("control", "Joins parallel branches")
            .output("merged", "Union of all branch outputs")
            .output("results", "Branch outputs in order")
    }
}

fn branch_key(index: usize) -> String {
    format!("branch-{}", index)
}
