//! Core workflow type definitions
//!
//! Workflows are plain JSON documents (camelCase keys) made of nodes and
//! port-addressed connections. Items flowing between nodes are arbitrary JSON
//! objects, processed in batches n8n-style: even a single payload travels as `[item]`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::flow::SwitchParameters;
use crate::trigger::TriggerType;

/// A single data item travelling along a connection.
pub type Item = Value;

/// Items produced on each output port of a node, indexed by port.
pub type PortItems = Vec<Vec<Item>>;

/// A complete workflow definition
///
/// Owned by the workflow repository. The engine reads it, and only writes back
/// `static_data` after a successful run that changed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-grading")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Nodes of this workflow, ids unique
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Directed, port-addressed connections between nodes
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Workflow-wide settings
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Whether triggers of this workflow are loaded on startup
    #[serde(default)]
    pub active: bool,
    /// Monotonic definition version
    #[serde(default)]
    pub version: u32,
    /// Key/value data persisted across executions
    #[serde(default)]
    pub static_data: Map<String, Value>,
}

impl Workflow {
    /// Looks a node up by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Nodes that can start an execution (Start and all trigger kinds).
    pub fn trigger_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.node_type.is_trigger())
    }
}

/// Workflow-wide settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// IANA timezone used by cron triggers (e.g. "Europe/Berlin")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Hard wall-clock limit for a single execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_secs: Option<u64>,
    /// Settings this engine does not interpret, kept for round-tripping
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "set-score")
    pub id: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The type of node which determines execution behavior
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Node-specific configuration as flexible JSON
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Disabled nodes pass their input through untouched
    #[serde(default)]
    pub disabled: bool,
    /// Retry, continue and fallback behavior on failure
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Node {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Resolves a named output port to its index.
    ///
    /// `main` and `true` are port 0, `false` is port 1, digits address ports
    /// directly and `fallback` maps to the Switch fallback port.
    pub fn output_port(&self, name: &str) -> Option<usize> {
        match name {
            "" | "main" | "true" | "output" => Some(0),
            "false" => Some(1),
            "fallback" if self.node_type == NodeType::Switch => Some(switch_fallback_port(&self.parameters)),
            other => other.parse().ok(),
        }
    }

    /// Reads a parameter by key.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Reads a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Reads a boolean parameter with a default.
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.parameters
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Reads an unsigned integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }

    /// Inputs a connection may target: `numberInputs` for Merge (two by
    /// default), up to [`MAX_NODE_PORTS`] for custom nodes, one otherwise.
    pub fn input_count(&self) -> usize {
        match &self.node_type {
            NodeType::Merge => self
                .param_u64("numberInputs")
                .map(|n| usize::try_from(n.max(1)).unwrap_or(usize::MAX))
                .unwrap_or(2),
            NodeType::Custom(_) => MAX_NODE_PORTS,
            _ => 1,
        }
    }
}

/// Most input or output ports a single node may declare.
pub const MAX_NODE_PORTS: usize = 64;

/// Port that receives unmatched Switch items: `fallbackOutput` when set,
/// otherwise the port right after the last rule.
pub fn switch_fallback_port(parameters: &Value) -> usize {
    match SwitchParameters::deserialize(parameters) {
        Ok(params) => params.fallback_port(),
        Err(_) => parameters
            .get("rules")
            .and_then(Value::as_array)
            .map(|rules| rules.len())
            .unwrap_or(0),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Node types understood by the engine
///
/// Unknown type names deserialize into [`NodeType::Custom`] and are delegated
/// to the external node runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    /// Manual entry point, passes the execution input through
    Start,
    /// Manual trigger, same behavior as Start
    ManualTrigger,
    /// Cron-scheduled trigger
    /// Expected params: { "expression": "0 */5 * * * *", "timezone": "UTC" }
    CronTrigger,
    /// Fixed-period trigger
    /// Expected params: { "intervalMs": 60000 }
    IntervalTrigger,
    /// HTTP ingress trigger
    /// Expected params: { "path": "/orders", "method": "POST", "responseMode": "onReceived" }
    WebhookTrigger,
    /// Polls a URL and fires when the payload changes
    /// Expected params: { "url": "https://api.example.com/status", "intervalMs": 60000 }
    PollingTrigger,
    /// Assigns fields on every item
    Set,
    /// Routes items to the true or false port
    If,
    /// Routes items to one of N ports
    Switch,
    /// Joins several inputs
    Merge,
    /// Runs a sandboxed Lua script
    Code,
    /// Outbound HTTP call
    HttpRequest,
    /// Anything else, executed by the external node runtime
    Custom(String),
}

impl NodeType {
    /// Canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Start => "start",
            NodeType::ManualTrigger => "manualTrigger",
            NodeType::CronTrigger => "cronTrigger",
            NodeType::IntervalTrigger => "intervalTrigger",
            NodeType::WebhookTrigger => "webhookTrigger",
            NodeType::PollingTrigger => "pollingTrigger",
            NodeType::Set => "set",
            NodeType::If => "if",
            NodeType::Switch => "switch",
            NodeType::Merge => "merge",
            NodeType::Code => "code",
            NodeType::HttpRequest => "httpRequest",
            NodeType::Custom(name) => name,
        }
    }

    /// True for nodes that can start an execution.
    pub fn is_trigger(&self) -> bool {
        self.trigger_type().is_some()
    }

    /// Trigger kind this node type is bound to, if any.
    pub fn trigger_type(&self) -> Option<TriggerType> {
        match self {
            NodeType::Start | NodeType::ManualTrigger => Some(TriggerType::Manual),
            NodeType::CronTrigger => Some(TriggerType::Cron),
            NodeType::IntervalTrigger => Some(TriggerType::Interval),
            NodeType::WebhookTrigger => Some(TriggerType::Webhook),
            NodeType::PollingTrigger => Some(TriggerType::Polling),
            _ => None,
        }
    }
}

impl From<String> for NodeType {
    fn from(raw: String) -> Self {
        // Accept the n8n-style "n8n-nodes-base.httpRequest" prefix as well
        let name = raw.rsplit('.').next().unwrap_or(&raw);
        match name.to_ascii_lowercase().as_str() {
            "start" => NodeType::Start,
            "manualtrigger" | "manual" => NodeType::ManualTrigger,
            "crontrigger" | "cron" | "scheduletrigger" => NodeType::CronTrigger,
            "intervaltrigger" | "interval" => NodeType::IntervalTrigger,
            "webhooktrigger" | "webhook" => NodeType::WebhookTrigger,
            "pollingtrigger" | "polling" => NodeType::PollingTrigger,
            "set" => NodeType::Set,
            "if" => NodeType::If,
            "switch" => NodeType::Switch,
            "merge" => NodeType::Merge,
            "code" | "function" => NodeType::Code,
            "httprequest" | "http" => NodeType::HttpRequest,
            _ => NodeType::Custom(raw),
        }
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        node_type.as_str().to_string()
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed connection from a node output port to a node input index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Node producing the items
    pub source_node_id: String,
    /// Named output port ("main", "true", "false", "0", "1", ...)
    #[serde(default = "main_port")]
    pub source_output: String,
    /// Node receiving the items
    pub target_node_id: String,
    /// Input index on the target (Merge uses 0 and 1)
    #[serde(default)]
    pub target_input: usize,
}

impl Connection {
    /// Connection from `main` to input 0.
    pub fn main(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            source_output: main_port(),
            target_node_id: target.into(),
            target_input: 0,
        }
    }

    /// Connection from a named port to a given input.
    pub fn port(
        source: impl Into<String>,
        output: impl Into<String>,
        target: impl Into<String>,
        input: usize,
    ) -> Self {
        Self {
            source_node_id: source.into(),
            source_output: output.into(),
            target_node_id: target.into(),
            target_input: input,
        }
    }
}

fn main_port() -> String {
    "main".to_string()
}

/// Failure handling for a single node
///
/// `max_retries` counts retries, so a node is attempted at most
/// `max_retries + 1` times. The legacy `maxTries` key counts attempts and is
/// converted on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawRetryConfig")]
pub struct RetryConfig {
    /// Re-run the node after a failure
    pub retry_on_fail: bool,
    /// Number of retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    #[serde(rename = "waitBetweenTries")]
    pub retry_interval_ms: u64,
    /// Emit an error item instead of failing the execution
    pub continue_on_fail: bool,
    /// Node that receives the error item when the node fails for good
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_node: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on_fail: false,
            max_retries: 0,
            retry_interval_ms: 1_000,
            continue_on_fail: false,
            fallback_node: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryConfig {
    #[serde(default)]
    retry_on_fail: bool,
    max_retries: Option<u32>,
    max_tries: Option<u32>,
    #[serde(alias = "retryIntervalMs", alias = "retryInterval")]
    wait_between_tries: Option<u64>,
    #[serde(default)]
    continue_on_fail: bool,
    fallback_node: Option<String>,
}

impl From<RawRetryConfig> for RetryConfig {
    fn from(raw: RawRetryConfig) -> Self {
        let defaults = RetryConfig::default();
        let max_retries = raw
            .max_retries
            .or_else(|| raw.max_tries.map(|tries| tries.saturating_sub(1)))
            .unwrap_or(defaults.max_retries);
        Self {
            retry_on_fail: raw.retry_on_fail,
            max_retries,
            retry_interval_ms: raw.wait_between_tries.unwrap_or(defaults.retry_interval_ms),
            continue_on_fail: raw.continue_on_fail,
            fallback_node: raw.fallback_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_type_names() {
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "n8n-nodes-base.httpRequest"
        }))
        .unwrap();
        assert_eq!(node.node_type, NodeType::HttpRequest);
        assert!(node.parameters.is_object());

        let custom = NodeType::from("acme.slackPost".to_string());
        assert_eq!(custom, NodeType::Custom("acme.slackPost".into()));
        assert_eq!(String::from(custom), "acme.slackPost");
        assert!(NodeType::WebhookTrigger.is_trigger());
        assert!(!NodeType::Set.is_trigger());
    }

    #[test]
    fn test_legacy_max_tries_counts_attempts() {
        let retry: RetryConfig = serde_json::from_value(json!({
            "retryOnFail": true,
            "maxTries": 3,
            "waitBetweenTries": 10
        }))
        .unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.retry_interval_ms, 10);

        let retry: RetryConfig =
            serde_json::from_value(json!({"retryOnFail": true, "maxRetries": 3})).unwrap();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_interval_ms, 1_000);
    }

    #[test]
    fn test_output_port_names() {
        let switch: Node = serde_json::from_value(json!({
            "id": "sw",
            "type": "switch",
            "parameters": {"rules": [{}, {}]}
        }))
        .unwrap();
        assert_eq!(switch.output_port("main"), Some(0));
        assert_eq!(switch.output_port("false"), Some(1));
        assert_eq!(switch.output_port("3"), Some(3));
        assert_eq!(switch.output_port("fallback"), Some(2));
        assert_eq!(switch.output_port("bogus"), None);
    }

    #[test]
    fn test_workflow_roundtrip_keeps_settings() {
        let wf: Workflow = serde_json::from_value(json!({
            "id": "wf",
            "name": "demo",
            "nodes": [{"id": "start", "type": "start"}],
            "connections": [],
            "settings": {"timezone": "Europe/Berlin", "saveManualExecutions": true}
        }))
        .unwrap();
        assert_eq!(wf.settings.timezone.as_deref(), Some("Europe/Berlin"));
        let back = serde_json::to_value(&wf).unwrap();
        assert_eq!(back["settings"]["saveManualExecutions"], json!(true));
        assert_eq!(wf.trigger_nodes().count(), 1);
    }
}
