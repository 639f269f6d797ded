//! Structural validation of workflow definitions
//!
//! Runs before any execution and before trigger activation. Errors make the
//! workflow unrunnable; warnings (unreachable nodes) are reported but tolerated.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::types::{NodeType, Workflow, MAX_NODE_PORTS};
use crate::runtime::flow::SwitchParameters;

/// Outcome of [`validate`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    /// On the current DFS path
    Visiting,
    /// Fully explored
    Done,
}

/// Validates a workflow's structure.
///
/// Checks, in order: duplicate node ids, dangling connections and fallback
/// references, port bounds, presence of a trigger node, directed cycles, and
/// finally reachability from trigger nodes (warnings only).
pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // STEP 1: Unique node ids
    let mut ids: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node id '{}'", node.id));
        }
    }

    // STEP 2: Every connection and fallback points at existing nodes
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &workflow.connections {
        let mut dangling = false;
        for (role, id) in [("source", &conn.source_node_id), ("target", &conn.target_node_id)] {
            if !ids.contains(id.as_str()) {
                errors.push(format!("Connection {role} '{id}' does not exist"));
                dangling = true;
            }
        }
        if dangling {
            continue;
        }
        if let Some(source) = workflow.node(&conn.source_node_id) {
            match source.output_port(&conn.source_output) {
                Some(port) if port < MAX_NODE_PORTS => {}
                _ => errors.push(format!(
                    "Connection from '{}' uses unknown output '{}'",
                    conn.source_node_id, conn.source_output
                )),
            }
        }
        if let Some(target) = workflow.node(&conn.target_node_id) {
            if conn.target_input >= target.input_count() {
                errors.push(format!(
                    "Connection into '{}' targets input {}, but the node has {}",
                    conn.target_node_id,
                    conn.target_input,
                    target.input_count()
                ));
            }
        }
        adjacency
            .entry(conn.source_node_id.as_str())
            .or_default()
            .push(conn.target_node_id.as_str());
    }
    for node in &workflow.nodes {
        if let Some(fallback) = &node.retry.fallback_node {
            if !ids.contains(fallback.as_str()) {
                errors.push(format!(
                    "Node '{}' names missing fallback node '{}'",
                    node.id, fallback
                ));
            } else if fallback == &node.id {
                errors.push(format!("Node '{}' cannot be its own fallback", node.id));
            }
        }
    }

    // STEP 3: Port counts stay within bounds
    for node in &workflow.nodes {
        match node.node_type {
            NodeType::Merge if node.input_count() > MAX_NODE_PORTS => {
                errors.push(format!(
                    "Merge '{}' declares {} inputs, at most {} are allowed",
                    node.id,
                    node.input_count(),
                    MAX_NODE_PORTS
                ));
            }
            NodeType::Switch => {
                if let Ok(params) = SwitchParameters::deserialize(&node.parameters) {
                    if params.port_count() > MAX_NODE_PORTS {
                        errors.push(format!(
                            "Switch '{}' addresses {} outputs, at most {} are allowed",
                            node.id,
                            params.port_count(),
                            MAX_NODE_PORTS
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    // STEP 4: At least one way in
    if workflow.trigger_nodes().next().is_none() {
        errors.push("Workflow has no trigger or start node".to_string());
    }

    // STEP 5: No directed cycles, regardless of node declaration order
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for node in &workflow.nodes {
        if marks.contains_key(node.id.as_str()) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = find_cycle(node.id.as_str(), &adjacency, &mut marks, &mut path) {
            errors.push(format!("Workflow contains a cycle: {}", cycle.join(" -> ")));
            break;
        }
    }

    // STEP 6: Reachability from trigger nodes
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: Vec<&str> = workflow.trigger_nodes().map(|n| n.id.as_str()).collect();
    // Fallback targets are entered through the error path, not a connection
    queue.extend(
        workflow
            .nodes
            .iter()
            .filter_map(|n| n.retry.fallback_node.as_deref()),
    );
    while let Some(id) = queue.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = adjacency.get(id) {
            queue.extend(next.iter().copied());
        }
    }
    for node in &workflow.nodes {
        if !reachable.contains(node.id.as_str()) {
            warnings.push(format!(
                "Node '{}' is not reachable from any trigger",
                node.id
            ));
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Depth-first search with an explicit recursion stack.
///
/// Returns the cycle as a node path that starts and ends on the same node.
fn find_cycle<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::Visiting);
    path.push(node);

    for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|&id| id == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = find_cycle(next, adjacency, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Connection, Node, NodeType, RetryConfig};
    use serde_json::json;

    fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            id: id.to_string(),
            name: None,
            node_type,
            parameters: json!({}),
            disabled: false,
            retry: RetryConfig::default(),
        }
    }

    fn workflow(nodes: Vec<Node>, connections: Vec<Connection>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: "test".into(),
            nodes,
            connections,
            settings: Default::default(),
            active: false,
            version: 1,
            static_data: Default::default(),
        }
    }

    #[test]
    fn test_valid_linear_workflow() {
        let wf = workflow(
            vec![node("start", NodeType::Start), node("set", NodeType::Set)],
            vec![Connection::main("start", "set")],
        );
        let report = validate(&wf);
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_cycle_detected_in_any_declaration_order() {
        let connections = vec![
            Connection::main("start", "a"),
            Connection::main("a", "b"),
            Connection::main("b", "c"),
            Connection::main("c", "a"),
        ];
        let forward = workflow(
            vec![
                node("start", NodeType::Start),
                node("a", NodeType::Set),
                node("b", NodeType::Set),
                node("c", NodeType::Set),
            ],
            connections.clone(),
        );
        let reversed = workflow(
            vec![
                node("c", NodeType::Set),
                node("b", NodeType::Set),
                node("a", NodeType::Set),
                node("start", NodeType::Start),
            ],
            connections.into_iter().rev().collect(),
        );

        for wf in [forward, reversed] {
            let report = validate(&wf);
            assert!(!report.is_valid);
            assert!(
                report.errors.iter().any(|e| e.contains("cycle")),
                "{:?}",
                report.errors
            );
        }
    }

    #[test]
    fn test_target_input_must_exist_on_target() {
        let mut merge = node("join", NodeType::Merge);
        merge.parameters = json!({"numberInputs": 2});
        let nodes = vec![node("start", NodeType::Start), node("set", NodeType::Set), merge];

        let fine = workflow(
            nodes.clone(),
            vec![
                Connection::main("start", "set"),
                Connection::port("start", "main", "join", 0),
                Connection::port("set", "main", "join", 1),
            ],
        );
        assert!(validate(&fine).is_valid, "{:?}", validate(&fine).errors);

        for (target, input) in [("join", 2), ("set", 1), ("join", usize::MAX)] {
            let wf = workflow(
                nodes.clone(),
                vec![Connection::main("start", "set"), Connection::port("start", "main", target, input)],
            );
            let report = validate(&wf);
            assert!(!report.is_valid, "{target}:{input}");
            assert!(report.errors.iter().any(|e| e.contains(&format!("targets input {input}"))));
        }
    }

    #[test]
    fn test_port_counts_are_capped() {
        let mut merge = node("join", NodeType::Merge);
        merge.parameters = json!({"numberInputs": 1_000_000});
        let wf = workflow(
            vec![node("start", NodeType::Start), merge],
            vec![Connection::main("start", "join")],
        );
        assert!(validate(&wf).errors.iter().any(|e| e.contains("1000000 inputs")));

        for params in [
            json!({"numberOutputs": 100_000_000_000u64}),
            json!({"fallbackOutput": u64::MAX}),
            json!({"rules": [{"operation": "equal", "value2": 1, "output": u64::MAX}]}),
        ] {
            let mut switch = node("route", NodeType::Switch);
            switch.parameters = params.clone();
            let wf = workflow(
                vec![node("start", NodeType::Start), switch],
                vec![Connection::main("start", "route")],
            );
            let report = validate(&wf);
            assert!(!report.is_valid, "{params}");
            assert!(report.errors.iter().any(|e| e.contains("outputs, at most 64")), "{:?}", report.errors);
        }

        let mut switch = node("route", NodeType::Switch);
        switch.parameters = json!({"numberOutputs": 4, "fallbackOutput": 3});
        let wf = workflow(
            vec![node("start", NodeType::Start), switch, node("late", NodeType::Set)],
            vec![
                Connection::main("start", "route"),
                Connection::port("route", "fallback", "late", 0),
            ],
        );
        assert!(validate(&wf).is_valid, "{:?}", validate(&wf).errors);

        let wf = workflow(
            vec![node("start", NodeType::Start), node("late", NodeType::Set)],
            vec![Connection::port("start", "99999999999", "late", 0)],
        );
        assert!(validate(&wf).errors.iter().any(|e| e.contains("unknown output")));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let wf = workflow(
            vec![node("start", NodeType::Start), node("a", NodeType::Set)],
            vec![Connection::main("start", "a"), Connection::main("a", "a")],
        );
        let report = validate(&wf);
        assert!(report.errors.iter().any(|e| e.contains("a -> a")));
    }

    #[test]
    fn test_dangling_connection_and_missing_trigger() {
        let wf = workflow(
            vec![node("a", NodeType::Set)],
            vec![Connection::main("a", "ghost")],
        );
        let report = validate(&wf);
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("ghost")));
        assert!(report.errors.iter().any(|e| e.contains("no trigger")));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let wf = workflow(
            vec![node("start", NodeType::Start), node("start", NodeType::Set)],
            vec![],
        );
        let report = validate(&wf);
        assert!(report.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_unreachable_node_is_only_a_warning() {
        let wf = workflow(
            vec![
                node("start", NodeType::Start),
                node("a", NodeType::Set),
                node("orphan", NodeType::Set),
            ],
            vec![Connection::main("start", "a")],
        );
        let report = validate(&wf);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("orphan"));
    }

    #[test]
    fn test_fallback_target_counts_as_reachable() {
        let mut failing = node("a", NodeType::Code);
        failing.retry.fallback_node = Some("recover".into());
        let wf = workflow(
            vec![node("start", NodeType::Start), failing, node("recover", NodeType::Set)],
            vec![Connection::main("start", "a")],
        );
        let report = validate(&wf);
        assert!(report.is_valid);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }
}
