//! Set node: assigns fields on every item
//!
//! `values` is either a plain object (`{"score": "={{ $json.points * 2 }}"}`),
//! an array of `{name, value}` pairs, or the typed form
//! `{"string": [{name, value}], "number": [...]}`. With `dotNotation` (default
//! on) `a.b` writes into nested objects. `keepOnlySet` drops the incoming fields.

use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::workflow::{Node, PortItems};

use super::{as_item, flatten_inputs, Expressions};

pub async fn run(exprs: &Expressions<'_>, node: &Node, inputs: PortItems) -> Result<PortItems> {
    let assignments = assignments(node)?;
    let keep_only_set = node.param_bool("keepOnlySet", false);
    let dot_notation = node.param_bool("dotNotation", true);

    let mut output = Vec::new();
    for (index, item) in flatten_inputs(inputs).into_iter().enumerate() {
        let mut target = if keep_only_set {
            Value::Object(Map::new())
        } else {
            as_item(item.clone())
        };
        for (name, raw) in &assignments {
            let value = exprs.resolve(raw, &item, index).await?;
            set_field(&mut target, name, value, dot_notation);
        }
        output.push(target);
    }
    Ok(vec![output])
}

fn assignments(node: &Node) -> Result<Vec<(String, Value)>> {
    let Some(values) = node.param("values") else {
        return Ok(Vec::new());
    };
    match values {
        Value::Array(pairs) => pairs.iter().map(|pair| named_pair(node, pair)).collect(),
        Value::Object(map) if is_typed_form(map) => map
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .map(|pair| named_pair(node, pair))
            .collect(),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => Err(EngineError::node(
            &node.id,
            format!("'values' must be an object or an array, got {other}"),
        )),
    }
}

fn is_typed_form(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map.values().all(|v| {
            v.as_array()
                .is_some_and(|pairs| pairs.iter().all(|p| p.get("name").is_some()))
        })
}

fn named_pair(node: &Node, pair: &Value) -> Result<(String, Value)> {
    let name = pair
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::node(&node.id, "Every assignment needs a 'name'"))?;
    Ok((name.to_string(), pair.get("value").cloned().unwrap_or(Value::Null)))
}

/// Writes `value` at `name`, creating intermediate objects for dotted names.
fn set_field(target: &mut Value, name: &str, value: Value, dot_notation: bool) {
    let path: Vec<&str> = if dot_notation {
        name.split('.').collect()
    } else {
        vec![name]
    };
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = target;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::test_support::{context, node};
    use crate::runtime::sandbox::Sandbox;
    use crate::workflow::NodeType;
    use serde_json::json;

    async fn run_set(params: Value, items: Vec<Value>) -> Vec<Value> {
        let sandbox = Sandbox::default();
        let ctx = context();
        let set = node("set", NodeType::Set, params);
        let exprs = Expressions::new(&sandbox, &ctx, &set);
        run(&exprs, &set, vec![items]).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_object_form_with_expressions() {
        let out = run_set(
            json!({"values": {"score": "={{ $json.points * 2 }}", "meta.source": "api"}}),
            vec![json!({"points": 5}), json!({"points": 1})],
        )
        .await;
        assert_eq!(out[0], json!({"points": 5, "score": 10, "meta": {"source": "api"}}));
        assert_eq!(out[1]["score"], json!(2));
    }

    #[tokio::test]
    async fn test_pairs_keep_only_set_and_no_dots() {
        let out = run_set(
            json!({
                "keepOnlySet": true,
                "dotNotation": false,
                "values": [{"name": "a.b", "value": "={{ $json.x }}"}]
            }),
            vec![json!({"x": 7, "y": 1})],
        )
        .await;
        assert_eq!(out, vec![json!({"a.b": 7})]);
    }

    #[tokio::test]
    async fn test_typed_form() {
        let out = run_set(
            json!({"values": {"string": [{"name": "s", "value": "x"}], "number": [{"name": "n", "value": 3}]}}),
            vec![json!({})],
        )
        .await;
        assert_eq!(out, vec![json!({"s": "x", "n": 3})]);
    }

    #[test]
    fn test_set_field_overwrites_scalars_on_path() {
        let mut item = json!({"a": 1});
        set_field(&mut item, "a.b", json!(2), true);
        assert_eq!(item, json!({"a": {"b": 2}}));
    }
}
