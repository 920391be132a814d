use crate::dag::Dag;
use flowcore::WorkflowError;
use std::collections::HashMap;

/// Partitions the DAG into execution levels.
///
/// Every node lands in exactly one level, strictly after all of its
/// predecessors. Ids inside a level are sorted so dispatch order is
/// reproducible.
pub fn execution_levels(dag: &Dag) -> Result<Vec<Vec<String>>, WorkflowError> {
    let mut in_degree: HashMap<&str, usize> = dag
        .nodes()
        .iter()
        .map(|n| (n.id.as_str(), dag.in_degree(&n.id)))
        .collect();
    let mut levels = Vec::new();
    let mut emitted = 0;

    while emitted < dag.len() {
        let mut level: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.to_string())
            .collect();

        if level.is_empty() {
            let stuck = in_degree.keys().min().map(|id| id.to_string()).unwrap_or_default();
            return Err(WorkflowError::CyclicDependency(stuck));
        }
        level.sort();

        for id in &level {
            in_degree.remove(id.as_str());
            for edge in dag.out_edges(id) {
                if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        emitted += level.len();
        levels.push(level);
    }

    tracing::debug!("Computed {} execution levels for {} nodes", levels.len(), emitted);
    Ok(levels)
}
