//! External runtime for node types this engine does not implement itself
//!
//! Requests are JSON-posted to `{base_url}/execute`; the runtime's success flag
//! and error text are relayed to the engine verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::workflow::Item;

/// Payload sent to the external runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRequest {
    pub node_type: String,
    pub parameters: Value,
    pub input_data: Vec<Item>,
    pub execution_id: String,
    pub node_id: String,
    pub context: RuntimeContext,
}

/// Execution metadata forwarded with each request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub workflow_id: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Runtime reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeResponse {
    pub success: bool,
    #[serde(default)]
    pub output_data: Vec<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait NodeRuntime: Send + Sync {
    async fn execute(&self, request: RuntimeRequest) -> Result<RuntimeResponse>;
}

/// HTTP implementation of [`NodeRuntime`]
#[derive(Debug, Clone)]
pub struct HttpNodeRuntime {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNodeRuntime {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Collaborator(format!("Failed to build runtime client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/execute", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl NodeRuntime for HttpNodeRuntime {
    async fn execute(&self, request: RuntimeRequest) -> Result<RuntimeResponse> {
        tracing::debug!(
            node_id = %request.node_id,
            node_type = %request.node_type,
            "🔌 Delegating node to external runtime"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::node(&request.node_id, format!("Node runtime unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::node(
                &request.node_id,
                format!("Node runtime returned {status}: {body}"),
            ));
        }

        response
            .json::<RuntimeResponse>()
            .await
            .map_err(|e| EngineError::node(&request.node_id, format!("Invalid node runtime response: {e}")))
    }
}
