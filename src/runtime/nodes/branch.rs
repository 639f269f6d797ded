//! If and Switch routing
//!
//! Both nodes leave items untouched and only choose the output port. Operands
//! are resolved per item, so `value1` is usually an expression like
//! `={{ $json.status }}`.

use serde::de::DeserializeOwned;

use crate::error::{EngineError, Result};
use crate::runtime::flow::{compare, route_by_index, Condition, IfParameters, SwitchMode, SwitchParameters};
use crate::workflow::{Item, Node, PortItems, MAX_NODE_PORTS};

use super::{flatten_inputs, Expressions};

fn parameters<T: DeserializeOwned>(node: &Node) -> Result<T> {
    serde_json::from_value(node.parameters.clone())
        .map_err(|e| EngineError::node(&node.id, format!("Invalid parameters: {e}")))
}

async fn holds(exprs: &Expressions<'_>, node: &Node, condition: &Condition, item: &Item, index: usize) -> Result<bool> {
    let left = exprs.resolve(&condition.value1, item, index).await?;
    let right = exprs.resolve(&condition.value2, item, index).await?;
    compare(condition.operation, &left, &right).map_err(|e| EngineError::node(&node.id, e))
}

/// Port 0 gets items matching the combined conditions, port 1 the rest.
pub async fn run_if(exprs: &Expressions<'_>, node: &Node, inputs: PortItems) -> Result<PortItems> {
    let params: IfParameters = parameters(node)?;
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();

    for (index, item) in flatten_inputs(inputs).into_iter().enumerate() {
        let mut results = Vec::with_capacity(params.conditions.len());
        for condition in &params.conditions {
            results.push(holds(exprs, node, condition, &item, index).await?);
        }
        if params.combine.apply(results) {
            matched.push(item);
        } else {
            unmatched.push(item);
        }
    }

    tracing::debug!(node_id = %node.id, matched = matched.len(), unmatched = unmatched.len(), "🔀 If routed items");
    Ok(vec![matched, unmatched])
}

/// Routes each item to the first matching rule's port, or the fallback port.
pub async fn run_switch(exprs: &Expressions<'_>, node: &Node, inputs: PortItems) -> Result<PortItems> {
    let params: SwitchParameters = parameters(node)?;
    let fallback = params.fallback_port();
    if params.port_count() > MAX_NODE_PORTS {
        return Err(EngineError::node(
            &node.id,
            format!("Switch addresses {} outputs, at most {MAX_NODE_PORTS} are allowed", params.port_count()),
        ));
    }
    let mut ports: PortItems = vec![Vec::new(); params.port_count()];

    for (index, item) in flatten_inputs(inputs).into_iter().enumerate() {
        let port = match params.mode {
            SwitchMode::Rules => {
                let mut chosen = None;
                for (position, rule) in params.rules.iter().enumerate() {
                    let left = rule.value1.as_ref().unwrap_or(&params.value1);
                    let left = exprs.resolve(left, &item, index).await?;
                    let right = exprs.resolve(&rule.value2, &item, index).await?;
                    if compare(rule.operation, &left, &right).map_err(|e| EngineError::node(&node.id, e))? {
                        chosen = Some(rule.output.unwrap_or(position));
                        break;
                    }
                }
                chosen
            }
            SwitchMode::Expression => {
                let value = exprs.resolve(&params.output, &item, index).await?;
                route_by_index(&value, params.output_count())
            }
        };
        ports[port.unwrap_or(fallback)].push(item);
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::test_support::{context, node};
    use crate::runtime::sandbox::Sandbox;
    use crate::workflow::NodeType;
    use serde_json::{json, Value};

    async fn route(node_type: NodeType, params: Value, items: Vec<Value>) -> Result<PortItems> {
        let sandbox = Sandbox::default();
        let ctx = context();
        let n = node("route", node_type.clone(), params);
        let exprs = Expressions::new(&sandbox, &ctx, &n);
        match node_type {
            NodeType::If => run_if(&exprs, &n, vec![items]).await,
            _ => run_switch(&exprs, &n, vec![items]).await,
        }
    }

    #[tokio::test]
    async fn test_if_and_combination() {
        let ports = route(
            NodeType::If,
            json!({
                "combine": "and",
                "conditions": [
                    {"value1": "={{ $json.age }}", "operation": "gte", "value2": 18},
                    {"value1": "={{ $json.country }}", "operation": "equal", "value2": "NL"}
                ]
            }),
            vec![
                json!({"age": 20, "country": "NL"}),
                json!({"age": 20, "country": "DE"}),
                json!({"age": 15, "country": "NL"}),
            ],
        )
        .await
        .unwrap();
        assert_eq!(ports[0], vec![json!({"age": 20, "country": "NL"})]);
        assert_eq!(ports[1].len(), 2);
    }

    #[tokio::test]
    async fn test_if_or_and_vars() {
        let ports = route(
            NodeType::If,
            json!({
                "combine": "or",
                "conditions": [
                    {"value1": "={{ $json.n }}", "operation": "larger", "value2": "={{ $vars.threshold }}"},
                    {"value1": "={{ $json.vip }}", "operation": "equal", "value2": true}
                ]
            }),
            vec![json!({"n": 11}), json!({"n": 1, "vip": true}), json!({"n": 1})],
        )
        .await
        .unwrap();
        assert_eq!(ports[0].len(), 2);
        assert_eq!(ports[1], vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_switch_port_limits() {
        let ports = route(
            NodeType::Switch,
            json!({"mode": "expression", "output": "={{ $json.to }}", "numberOutputs": 63}),
            vec![json!({"to": 62}), json!({"to": 63})],
        )
        .await
        .unwrap();
        assert_eq!(ports.len(), 64);
        assert_eq!(ports[62], vec![json!({"to": 62})]);
        assert_eq!(ports[63], vec![json!({"to": 63})]);

        for params in [json!({"numberOutputs": 64}), json!({"fallbackOutput": u64::MAX})] {
            let err = route(NodeType::Switch, params, vec![json!({})]).await.unwrap_err();
            assert!(err.to_string().contains("at most 64"), "{err}");
        }
    }

    #[tokio::test]
    async fn test_switch_rules_and_fallback() {
        let ports = route(
            NodeType::Switch,
            json!({
                "value1": "={{ $json.kind }}",
                "rules": [
                    {"operation": "equal", "value2": "a"},
                    {"operation": "equal", "value2": "b"}
                ]
            }),
            vec![json!({"kind": "b"}), json!({"kind": "z"}), json!({"kind": "a"})],
        )
        .await
        .unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0], vec![json!({"kind": "a"})]);
        assert_eq!(ports[1], vec![json!({"kind": "b"})]);
        assert_eq!(ports[2], vec![json!({"kind": "z"})]);
    }

    #[tokio::test]
    async fn test_switch_expression_mode() {
        let ports = route(
            NodeType::Switch,
            json!({"mode": "expression", "numberOutputs": 2, "output": "={{ $json.slot }}"}),
            vec![json!({"slot": 1}), json!({"slot": 7})],
        )
        .await
        .unwrap();
        assert_eq!(ports[1], vec![json!({"slot": 1})]);
        assert_eq!(ports[2], vec![json!({"slot": 7})]);
    }

    #[tokio::test]
    async fn test_invalid_regex_fails_node() {
        let err = route(
            NodeType::If,
            json!({"conditions": [{"value1": "x", "operation": "regex", "value2": "("}]}),
            vec![json!({})],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Invalid regex"));
    }
}
