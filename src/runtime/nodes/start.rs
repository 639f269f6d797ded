//! Start and trigger nodes: hand the execution input to the first connection.

use serde_json::json;

use crate::workflow::{Node, NodeType, PortItems};

use super::flatten_inputs;

/// Passes the input through. Manual triggers emit a single empty item when
/// started without data, other kinds only with `alwaysOutputData`.
pub fn run(node: &Node, inputs: PortItems) -> PortItems {
    let items = flatten_inputs(inputs);
    let always = node.param_bool("alwaysOutputData", node.node_type == NodeType::ManualTrigger);
    if items.is_empty() && always {
        return vec![vec![json!({})]];
    }
    vec![items]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::test_support::node;

    #[test]
    fn test_passthrough_and_empty_input() {
        let start = node("start", NodeType::Start, json!({}));
        assert_eq!(run(&start, vec![vec![json!({"a": 1})]]), vec![vec![json!({"a": 1})]]);
        assert_eq!(run(&start, vec![vec![]]), vec![Vec::<serde_json::Value>::new()]);

        let manual = node("manual", NodeType::ManualTrigger, json!({}));
        assert_eq!(run(&manual, vec![]), vec![vec![json!({})]]);
    }
}
