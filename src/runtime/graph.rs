//! Petgraph view of a workflow
//!
//! Nodes are workflow node ids, edges carry the resolved output port and input
//! index of each connection. Built once per execution.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, Result};
use crate::workflow::Workflow;

/// Port-resolved connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLink {
    pub output: usize,
    pub input: usize,
}

/// One edge as seen from either end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeInfo {
    pub id: EdgeIndex,
    pub source: String,
    pub target: String,
    pub link: PortLink,
}

#[derive(Debug)]
pub struct ExecutionGraph {
    graph: DiGraph<String, PortLink>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl ExecutionGraph {
    /// Builds the graph, resolving named ports. Rejects cycles.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        tracing::debug!("🏗️ Building execution graph for '{}'", workflow.id);

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();
        for node in &workflow.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for conn in &workflow.connections {
            let unknown = |id: &str| EngineError::Validation(vec![format!("Connection references unknown node '{id}'")]);
            let from = *node_id_to_index
                .get(&conn.source_node_id)
                .ok_or_else(|| unknown(&conn.source_node_id))?;
            let to = *node_id_to_index
                .get(&conn.target_node_id)
                .ok_or_else(|| unknown(&conn.target_node_id))?;
            let output = workflow
                .node(&conn.source_node_id)
                .and_then(|node| node.output_port(&conn.source_output))
                .ok_or_else(|| {
                    EngineError::Validation(vec![format!(
                        "Unknown output '{}' on node '{}'",
                        conn.source_output, conn.source_node_id
                    )])
                })?;
            graph.add_edge(
                from,
                to,
                PortLink {
                    output,
                    input: conn.target_input,
                },
            );
        }

        if toposort(&graph, None).is_err() {
            return Err(EngineError::Validation(vec![
                "Workflow contains cycles - must be a DAG".to_string(),
            ]));
        }

        Ok(Self {
            graph,
            node_id_to_index,
        })
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_id_to_index.contains_key(node_id)
    }

    pub fn incoming(&self, node_id: &str) -> Vec<EdgeInfo> {
        self.edges(node_id, Direction::Incoming)
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<EdgeInfo> {
        self.edges(node_id, Direction::Outgoing)
    }

    fn edges(&self, node_id: &str, direction: Direction) -> Vec<EdgeInfo> {
        let Some(&index) = self.node_id_to_index.get(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<EdgeInfo> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| EdgeInfo {
                id: edge.id(),
                source: self.graph[edge.source()].clone(),
                target: self.graph[edge.target()].clone(),
                link: *edge.weight(),
            })
            .collect();
        // petgraph yields edges newest first; keep declaration order
        edges.sort_by_key(|edge| edge.id);
        edges
    }

    /// Nodes reachable from `starts`, the starts included.
    pub fn reachable_from<'a>(&self, starts: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        self.walk(starts, Direction::Outgoing)
    }

    /// Nodes from which any of `targets` can be reached, the targets included.
    pub fn ancestors_of<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        self.walk(targets, Direction::Incoming)
    }

    fn walk<'a>(&self, roots: impl IntoIterator<Item = &'a str>, direction: Direction) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = roots
            .into_iter()
            .filter_map(|id| self.node_id_to_index.get(id).copied())
            .collect();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(current, direction));
        }

        seen.into_iter().map(|index| self.graph[index].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diamond() -> Workflow {
        serde_json::from_value(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "check", "type": "if"},
                {"id": "yes", "type": "set"},
                {"id": "no", "type": "set"},
                {"id": "join", "type": "merge"}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "check"},
                {"sourceNodeId": "check", "sourceOutput": "true", "targetNodeId": "yes"},
                {"sourceNodeId": "check", "sourceOutput": "false", "targetNodeId": "no"},
                {"sourceNodeId": "yes", "targetNodeId": "join"},
                {"sourceNodeId": "no", "targetNodeId": "join", "targetInput": 1}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_ports_resolved() {
        let graph = ExecutionGraph::from_workflow(&diamond()).unwrap();
        let out = graph.outgoing("check");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, "yes");
        assert_eq!(out[0].link.output, 0);
        assert_eq!(out[1].link.output, 1);

        let incoming = graph.incoming("join");
        assert_eq!(incoming.iter().map(|e| e.link.input).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_reachability() {
        let graph = ExecutionGraph::from_workflow(&diamond()).unwrap();
        assert_eq!(graph.reachable_from(["yes"]).len(), 2);
        let ancestors = graph.ancestors_of(["yes"]);
        assert!(ancestors.contains("start") && ancestors.contains("check"));
        assert!(!ancestors.contains("no"));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = diamond();
        wf.connections.push(crate::workflow::Connection::main("join", "check"));
        assert!(ExecutionGraph::from_workflow(&wf).is_err());
    }
}
