use crate::dag::Dag;
use flowcore::{ExecutionContext, Value, ValueMap};

/// Builds the input map for `node_id`.
///
/// Layers, later ones winning on key collisions:
/// 1. global variables
/// 2. each predecessor's full output map under the predecessor id
/// 3. `outputs[sourceHandle] -> inputs[targetHandle]` for wired edges
///
/// Node config is never merged in.
pub fn resolve_inputs(dag: &Dag, node_id: &str, ctx: &ExecutionContext) -> ValueMap {
    let mut inputs = ctx.variables();

    for pred in dag.predecessors(node_id) {
        if let Some(outputs) = ctx.get_output(&pred) {
            inputs.insert(pred, Value::Object(outputs));
        }
    }

    for edge in dag.in_edges(node_id) {
        if edge.source_handle.is_empty() || edge.target_handle.is_empty() {
            continue;
        }
        let value = ctx
            .get_output(&edge.source)
            .and_then(|outputs| outputs.get(&edge.source_handle).cloned());
        if let Some(value) = value {
            inputs.insert(edge.target_handle.clone(), value);
        }
    }

    inputs
}
