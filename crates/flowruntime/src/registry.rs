use flowcore::{ExecutorLookup, NodeExecutor, NodeMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available node types
///
/// Cheap to clone. Populate it before the first run; it is read-only while
/// runs are in flight.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its type tag. Last registration wins.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type().to_string();
        if self.executors.contains_key(&node_type) {
            tracing::info!("Replacing node type: {}", node_type);
        } else {
            tracing::info!("Registering node type: {}", node_type);
        }
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.executors.get(node_type).map(|e| e.metadata())
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl ExecutorLookup for NodeRegistry {
    fn executor(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.get(node_type)
    }
}
