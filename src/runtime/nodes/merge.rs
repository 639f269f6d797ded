//! Merge node: joins items arriving on several inputs
//!
//! The engine waits until every input has either delivered or gone dead, or
//! until `waitTimeoutMs` elapsed, before calling [`run`]. Inputs that never
//! delivered arrive here as empty lists.
//!
//! Modes:
//! - `append`: all items of input 0, then input 1, ...
//! - `combine`: joins input 0 and input 1 on `field1`/`field2` (`inner`, `left`, `outer`)
//! - `multiplex`: every pairing of input 0 and input 1 items, merged
//! - `wait`: appends, but only when every input delivered something

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::runtime::flow::{compare, Operation};
use crate::workflow::{Item, Node, PortItems, MAX_NODE_PORTS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeMode {
    #[default]
    Append,
    #[serde(alias = "mergeByKey", alias = "combineByFields")]
    Combine,
    #[serde(alias = "combineAll")]
    Multiplex,
    #[serde(alias = "chooseBranch")]
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinMode {
    #[default]
    Inner,
    Left,
    Outer,
}

/// What a matched pair emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinOutput {
    #[default]
    Both,
    Input1,
    Input2,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeParameters {
    #[serde(default)]
    pub mode: MergeMode,
    #[serde(default)]
    pub join_mode: JoinMode,
    #[serde(default)]
    pub field1: Option<String>,
    #[serde(default)]
    pub field2: Option<String>,
    #[serde(default)]
    pub output: JoinOutput,
    #[serde(default)]
    pub number_inputs: Option<usize>,
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

impl MergeParameters {
    pub fn from_node(node: &Node) -> Result<Self> {
        serde_json::from_value(node.parameters.clone())
            .map_err(|e| EngineError::node(&node.id, format!("Invalid merge parameters: {e}")))
    }
}

/// Number of inputs the node waits for.
pub fn input_count(node: &Node) -> usize {
    node.input_count().min(MAX_NODE_PORTS)
}

/// Deadline after the first delivery, if configured.
pub fn wait_timeout_ms(node: &Node) -> Option<u64> {
    node.param_u64("waitTimeoutMs")
}

pub fn run(node: &Node, mut inputs: PortItems) -> Result<PortItems> {
    let params = MergeParameters::from_node(node)?;
    let expected = params.number_inputs.unwrap_or(2).min(MAX_NODE_PORTS).max(inputs.len()).max(1);
    inputs.resize_with(expected, Vec::new);

    let merged = match params.mode {
        MergeMode::Append => inputs.into_iter().flatten().collect(),
        MergeMode::Wait => {
            if inputs.iter().any(Vec::is_empty) {
                Vec::new()
            } else {
                inputs.into_iter().flatten().collect()
            }
        }
        MergeMode::Multiplex => {
            let (first, second) = (input(&inputs, 0), input(&inputs, 1));
            let mut out = Vec::with_capacity(first.len() * second.len());
            for left in first {
                for right in second {
                    out.push(merge_objects(left, right));
                }
            }
            out
        }
        MergeMode::Combine => combine(node, &params, input(&inputs, 0), input(&inputs, 1))?,
    };

    tracing::debug!(node_id = %node.id, mode = ?params.mode, items = merged.len(), "🔗 Merged inputs");
    Ok(vec![merged])
}

fn input(inputs: &PortItems, index: usize) -> &[Item] {
    inputs.get(index).map(Vec::as_slice).unwrap_or(&[])
}

fn combine(node: &Node, params: &MergeParameters, left: &[Item], right: &[Item]) -> Result<Vec<Item>> {
    let field1 = params
        .field1
        .as_deref()
        .ok_or_else(|| EngineError::node(&node.id, "Combine mode needs 'field1'"))?;
    let field2 = params.field2.as_deref().unwrap_or(field1);

    let emit = |a: &Item, b: &Item| match params.output {
        JoinOutput::Both => merge_objects(a, b),
        JoinOutput::Input1 => a.clone(),
        JoinOutput::Input2 => b.clone(),
    };

    let mut out = Vec::new();
    let mut right_matched = vec![false; right.len()];
    for a in left {
        let key = field(a, field1);
        let mut matched = false;
        if !key.is_null() {
            for (j, b) in right.iter().enumerate() {
                let other = field(b, field2);
                if compare(Operation::Equal, &key, &other).unwrap_or(false) {
                    matched = true;
                    right_matched[j] = true;
                    out.push(emit(a, b));
                }
            }
        }
        if !matched && params.join_mode != JoinMode::Inner {
            out.push(a.clone());
        }
    }
    if params.join_mode == JoinMode::Outer {
        out.extend(
            right
                .iter()
                .zip(right_matched)
                .filter(|(_, matched)| !matched)
                .map(|(b, _)| b.clone()),
        );
    }
    Ok(out)
}

/// Dotted-path field lookup, `null` when missing.
fn field(item: &Item, path: &str) -> Value {
    path.split('.')
        .try_fold(item, |current, key| current.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Shallow merge; fields of `b` win.
fn merge_objects(a: &Item, b: &Item) -> Item {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged: Map<String, Value> = a.clone();
            merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        _ => b.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::test_support::node;
    use crate::workflow::NodeType;
    use serde_json::json;

    fn merge(params: Value, inputs: PortItems) -> Vec<Item> {
        run(&node("merge", NodeType::Merge, params), inputs).unwrap().remove(0)
    }

    #[test]
    fn test_append_counts() {
        let out = merge(json!({}), vec![vec![json!({"a": 1}), json!({"a": 2})], vec![json!({"b": 1})]]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], json!({"b": 1}));

        let out = merge(json!({}), vec![vec![json!({"a": 1})]]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_wait_needs_every_input() {
        assert!(merge(json!({"mode": "wait"}), vec![vec![json!({})], vec![]]).is_empty());
        assert_eq!(merge(json!({"mode": "wait"}), vec![vec![json!({})], vec![json!({})]]).len(), 2);
    }

    #[test]
    fn test_combine_join_modes() {
        let users = vec![json!({"id": 1, "name": "ada"}), json!({"id": 2, "name": "bob"})];
        let orders = vec![json!({"userId": "1", "total": 9}), json!({"userId": 3, "total": 1})];
        let inputs = vec![users, orders];

        let inner = merge(json!({"mode": "combine", "field1": "id", "field2": "userId"}), inputs.clone());
        assert_eq!(inner, vec![json!({"id": 1, "name": "ada", "userId": "1", "total": 9})]);

        let left = merge(
            json!({"mode": "combine", "joinMode": "left", "field1": "id", "field2": "userId"}),
            inputs.clone(),
        );
        assert_eq!(left.len(), 2);

        let outer = merge(
            json!({"mode": "combine", "joinMode": "outer", "field1": "id", "field2": "userId", "output": "input1"}),
            inputs,
        );
        assert_eq!(outer.len(), 3);
        assert_eq!(outer[0], json!({"id": 1, "name": "ada"}));
    }

    #[test]
    fn test_combine_without_field_fails() {
        let err = run(&node("m", NodeType::Merge, json!({"mode": "combine"})), vec![vec![], vec![]]).unwrap_err();
        assert!(err.to_string().contains("field1"));
    }

    #[test]
    fn test_multiplex() {
        let out = merge(
            json!({"mode": "multiplex"}),
            vec![vec![json!({"a": 1}), json!({"a": 2})], vec![json!({"b": 1}), json!({"b": 2})]],
        );
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], json!({"a": 2, "b": 2}));
    }
}
