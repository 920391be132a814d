use flowcore::{Connection, NodeSpec, Workflow, WorkflowError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Validated, indexed form of a workflow graph.
///
/// Node weights are positions into `Workflow::nodes`, edge weights are
/// positions into `Workflow::edges`, so source order is always recoverable.
#[derive(Debug)]
pub struct Dag {
    graph: DiGraph<usize, usize>,
    index: HashMap<String, NodeIndex>,
    nodes: Vec<NodeSpec>,
    edges: Vec<Connection>,
    start: NodeIndex,
    ends: Vec<String>,
}

impl Dag {
    /// Validates `workflow` and builds the DAG.
    ///
    /// Rejects duplicate ids, anything but exactly one start node, edges
    /// with unknown endpoints, and cycles.
    pub fn build(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::with_capacity(workflow.nodes.len(), workflow.edges.len());
        let mut index = HashMap::with_capacity(workflow.nodes.len());
        let mut starts = Vec::new();
        let mut ends = Vec::new();

        // Pass 1: index nodes, classify start/end
        for (pos, node) in workflow.nodes.iter().enumerate() {
            if index.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(pos);
            index.insert(node.id.clone(), idx);
            if node.is_start() {
                starts.push(idx);
            }
            if node.is_end() {
                ends.push(node.id.clone());
            }
        }
        let start = match starts.as_slice() {
            [] => return Err(WorkflowError::NoStartNode),
            [only] => *only,
            many => return Err(WorkflowError::MultipleStartNodes(many.len())),
        };

        // Pass 2: ingest edges
        for (pos, edge) in workflow.edges.iter().enumerate() {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| WorkflowError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: id.to_string(),
                })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;
            graph.add_edge(source, target, pos);
        }

        let dag = Self {
            graph,
            index,
            nodes: workflow.nodes.clone(),
            edges: workflow.edges.clone(),
            start,
            ends,
        };

        // Pass 3: cycle detection
        dag.detect_cycle()?;
        Ok(dag)
    }

    /// Iterative DFS with a three-colour marker. An edge into a node that is
    /// still on the stack closes a cycle.
    fn detect_cycle(&self) -> Result<(), WorkflowError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            marks[root.index()] = Mark::OnStack;
            stack.push((root, self.successor_indices(root)));

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                match top.1.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => {
                            return Err(WorkflowError::CyclicDependency(
                                self.node_at(next).id.clone(),
                            ))
                        }
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            let succ = self.successor_indices(next);
                            stack.push((next, succ));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn successor_indices(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(idx, Direction::Outgoing).collect()
    }

    fn node_at(&self, idx: NodeIndex) -> &NodeSpec {
        &self.nodes[self.graph[idx]]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in source order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|idx| self.node_at(*idx))
    }

    pub fn start_node_id(&self) -> &str {
        &self.node_at(self.start).id
    }

    /// End-node ids in source order.
    pub fn end_node_ids(&self) -> &[String] {
        &self.ends
    }

    /// Distinct successor ids, sorted.
    pub fn successors(&self, id: &str) -> Vec<String> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    /// Distinct predecessor ids, sorted.
    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    fn neighbor_ids(&self, id: &str, dir: Direction) -> Vec<String> {
        let Some(idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(*idx, dir)
            .map(|n| self.node_at(n).id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of incoming edges (parallel edges counted separately).
    pub fn in_degree(&self, id: &str) -> usize {
        self.index
            .get(id)
            .map(|idx| self.graph.edges_directed(*idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    /// Outgoing edge records in source order.
    pub fn out_edges(&self, id: &str) -> Vec<&Connection> {
        self.edges_of(id, Direction::Outgoing)
    }

    /// Incoming edge records in source order.
    pub fn in_edges(&self, id: &str) -> Vec<&Connection> {
        self.edges_of(id, Direction::Incoming)
    }

    fn edges_of(&self, id: &str, dir: Direction) -> Vec<&Connection> {
        let Some(idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(*idx, dir)
            .map(|e| *e.weight())
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|p| &self.edges[p]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(types: &[(&str, &str)], edges: &[(&str, &str)]) -> Workflow {
        let mut wf = Workflow::new("test");
        for (id, ty) in types {
            wf.add_node(NodeSpec::new(*id, *ty));
        }
        for (s, t) in edges {
            wf.connect(*s, *t);
        }
        wf
    }

    #[test]
    fn builds_valid_graph() {
        let wf = chain(
            &[("s", "start"), ("a", "variable"), ("e1", "end"), ("e2", "end")],
            &[("s", "a"), ("a", "e1"), ("a", "e2")],
        );
        let dag = Dag::build(&wf).unwrap();
        assert_eq!(dag.start_node_id(), "s");
        assert_eq!(dag.end_node_ids(), ["e1", "e2"]);
        assert_eq!(dag.successors("a"), vec!["e1", "e2"]);
        assert_eq!(dag.predecessors("a"), vec!["s"]);
        assert_eq!(dag.in_degree("e1"), 1);
    }

    #[test]
    fn rejects_cycle() {
        let wf = chain(
            &[("s", "start"), ("a", "x"), ("b", "x"), ("c", "x")],
            &[("s", "a"), ("a", "b"), ("b", "c"), ("c", "a")],
        );
        assert!(matches!(Dag::build(&wf), Err(WorkflowError::CyclicDependency(_))));
    }

    #[test]
    fn rejects_self_loop() {
        let wf = chain(&[("s", "start")], &[("s", "s")]);
        assert!(matches!(Dag::build(&wf), Err(WorkflowError::CyclicDependency(_))));
    }

    #[test]
    fn rejects_start_count() {
        let none = chain(&[("a", "x")], &[]);
        assert_eq!(Dag::build(&none).unwrap_err(), WorkflowError::NoStartNode);

        let two = chain(&[("a", "start"), ("b", "start")], &[]);
        assert_eq!(Dag::build(&two).unwrap_err(), WorkflowError::MultipleStartNodes(2));
    }

    #[test]
    fn rejects_dangling_edge() {
        let wf = chain(&[("s", "start")], &[("s", "ghost")]);
        assert!(matches!(
            Dag::build(&wf),
            Err(WorkflowError::DanglingEdge { node, .. }) if node == "ghost"
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let wf = chain(&[("s", "start"), ("s", "end")], &[]);
        assert_eq!(Dag::build(&wf).unwrap_err(), WorkflowError::DuplicateNode("s".into()));
    }
}
