//! Built-in node behaviors
//!
//! Each behavior takes the buffered input ports and returns output ports. Only
//! the Merge node looks at more than one input; everyone else works on the
//! concatenation of their inputs.

pub mod branch;
pub mod code;
pub mod http;
pub mod merge;
pub mod set;
pub mod start;

use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

use crate::error::{EngineError, Result};
use crate::runtime::context::{ExecutionContext, StaticDataPatch};
use crate::runtime::flow::{self, ExprBody, ParsedValue, PathRoot, TemplatePart};
use crate::runtime::sandbox::Sandbox;
use crate::workflow::{Item, Node, PortItems};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a node run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Items per output port
    pub ports: PortItems,
    /// Lines captured from `console.*`
    pub logs: Vec<String>,
    /// Static data keys the node changed, if any
    pub static_data: Option<StaticDataPatch>,
}

impl From<PortItems> for NodeOutput {
    fn from(ports: PortItems) -> Self {
        Self {
            ports,
            ..Default::default()
        }
    }
}

/// All items of all inputs, in input order.
pub fn flatten_inputs(inputs: PortItems) -> Vec<Item> {
    inputs.into_iter().flatten().collect()
}

/// Turns a script or runtime result into items.
///
/// Arrays become one item per element, objects a single item, `null` and `{}`
/// no items. Scalars are wrapped as `{"value": x}`.
pub fn normalize_items(value: Value) -> Vec<Item> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(values) => values.into_iter().map(as_item).collect(),
        Value::Object(map) if map.is_empty() => Vec::new(),
        other => vec![as_item(other)],
    }
}

/// Wraps non-object values so every item is a JSON object.
pub fn as_item(value: Value) -> Item {
    match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Error item emitted when a node continues on failure.
pub fn error_item(node_id: &str, message: &str) -> Item {
    serde_json::json!({ "error": message, "node": node_id })
}

/// Resolves `=`-prefixed parameter values for one node
pub struct Expressions<'a> {
    sandbox: &'a Sandbox,
    context: &'a ExecutionContext,
    node: &'a Node,
}

impl<'a> Expressions<'a> {
    pub fn new(sandbox: &'a Sandbox, context: &'a ExecutionContext, node: &'a Node) -> Self {
        Self {
            sandbox,
            context,
            node,
        }
    }

    /// Resolves a parameter value against `item`, descending into arrays and objects.
    pub fn resolve<'b>(&'b self, value: &'b Value, item: &'b Item, index: usize) -> BoxFuture<'b, Result<Value>> {
        Box::pin(async move {
            match value {
                Value::String(_) => self.resolve_scalar(value, item, index).await,
                Value::Array(values) => {
                    let mut resolved = Vec::with_capacity(values.len());
                    for v in values {
                        resolved.push(self.resolve(v, item, index).await?);
                    }
                    Ok(Value::Array(resolved))
                }
                Value::Object(map) => {
                    let mut resolved = Map::with_capacity(map.len());
                    for (k, v) in map {
                        resolved.insert(k.clone(), self.resolve(v, item, index).await?);
                    }
                    Ok(Value::Object(resolved))
                }
                other => Ok(other.clone()),
            }
        })
    }

    async fn resolve_scalar(&self, value: &Value, item: &Item, index: usize) -> Result<Value> {
        match flow::parse_value(value) {
            ParsedValue::Literal => Ok(value.clone()),
            ParsedValue::Single(body) => self.evaluate(&body, item, index).await,
            ParsedValue::Template(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => rendered.push_str(&text),
                        TemplatePart::Expr(body) => {
                            rendered.push_str(&flow::to_text(&self.evaluate(&body, item, index).await?))
                        }
                    }
                }
                Ok(Value::String(rendered))
            }
        }
    }

    async fn evaluate(&self, body: &ExprBody, item: &Item, index: usize) -> Result<Value> {
        match body {
            ExprBody::Path { root, segments } => {
                let vars;
                let base = match root {
                    PathRoot::Json => item,
                    PathRoot::Vars => {
                        vars = Value::Object(self.context.variables.clone());
                        &vars
                    }
                };
                Ok(flow::lookup(base, segments).cloned().unwrap_or(Value::Null))
            }
            ExprBody::Script(code) => {
                let mut extra = Map::new();
                extra.insert("vars".into(), Value::Object(self.context.variables.clone()));
                extra.insert("node".into(), node_binding(self.node));
                extra.insert("workflow".into(), self.context.workflow_binding());
                extra.insert("execution".into(), self.context.execution_binding());
                extra.insert("itemIndex".into(), Value::from(index));
                self.sandbox
                    .execute_expression(code, item, extra)
                    .await
                    .map_err(|e| EngineError::node(&self.node.id, format!("Expression '{code}' failed: {e}")))
            }
        }
    }
}

/// Metadata table exposed to scripts as `node`.
pub fn node_binding(node: &Node) -> Value {
    serde_json::json!({
        "id": node.id,
        "name": node.display_name(),
        "type": node.node_type.as_str(),
        "parameters": node.parameters,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::runtime::context::ExecutionMode;
    use crate::workflow::{NodeType, RetryConfig, WorkflowSettings};

    pub fn node(id: &str, node_type: NodeType, parameters: Value) -> Node {
        Node {
            id: id.to_string(),
            name: None,
            node_type,
            parameters,
            disabled: false,
            retry: RetryConfig::default(),
        }
    }

    pub fn context() -> ExecutionContext {
        let mut variables = Map::new();
        variables.insert("threshold".into(), serde_json::json!(10));
        ExecutionContext {
            execution_id: "exec-test".into(),
            workflow_id: "wf".into(),
            workflow_name: "test".into(),
            user_id: None,
            mode: ExecutionMode::Manual,
            source: "test".into(),
            input_data: vec![],
            variables,
            static_data: Map::new(),
            settings: WorkflowSettings::default(),
            started_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::workflow::NodeType;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_paths_templates_and_scripts() {
        let sandbox = Sandbox::default();
        let ctx = context();
        let node = node("n", NodeType::Set, json!({}));
        let exprs = Expressions::new(&sandbox, &ctx, &node);
        let item = json!({"user": {"name": "Ada"}, "price": 4});

        let params = json!({
            "name": "={{ $json.user.name }}",
            "greeting": "=Hi {{ $json.user.name }}, limit {{ $vars.threshold }}",
            "double": "={{ $json.price * 2 }}",
            "missing": "={{ $json.nope }}",
            "nested": ["={{ $json.price }}", 1],
            "plain": "text"
        });
        let resolved = exprs.resolve(&params, &item, 0).await.unwrap();
        assert_eq!(
            resolved,
            json!({
                "name": "Ada",
                "greeting": "Hi Ada, limit 10",
                "double": 8,
                "missing": null,
                "nested": [4, 1],
                "plain": "text"
            })
        );
    }

    #[tokio::test]
    async fn test_script_expression_error_names_node() {
        let sandbox = Sandbox::default();
        let ctx = context();
        let node = node("calc", NodeType::Set, json!({}));
        let exprs = Expressions::new(&sandbox, &ctx, &node);
        let err = exprs
            .resolve(&json!("={{ nil + 1 }}"), &json!({}), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("calc"));
    }

    #[test]
    fn test_normalize_items() {
        assert_eq!(normalize_items(json!([{"a": 1}, 2])), vec![json!({"a": 1}), json!({"value": 2})]);
        assert!(normalize_items(json!({})).is_empty());
        assert!(normalize_items(Value::Null).is_empty());
        assert_eq!(normalize_items(json!("x")), vec![json!({"value": "x"})]);
    }
}
