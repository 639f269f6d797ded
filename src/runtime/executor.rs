//! Node executor - dispatches a single node run to its behavior
//!
//! The executor is stateless apart from the table of in-flight runs. Every
//! run gets a child of the execution's cancellation token so that stopping an
//! execution interrupts whatever node is currently running, including scripts
//! spinning inside the sandbox.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::runtime::context::ExecutionContext;
use crate::runtime::nodes::{self, http::HttpClient, Expressions, NodeOutput};
use crate::runtime::sandbox::Sandbox;
use crate::services::{CredentialVault, NodeRuntime, RuntimeContext, RuntimeRequest};
use crate::workflow::{Node, NodeType, PortItems};

pub struct NodeExecutor {
    sandbox: Sandbox,
    http: HttpClient,
    runtime: Option<Arc<dyn NodeRuntime>>,
    /// execution id -> node id -> token of the running attempt
    in_flight: Mutex<HashMap<String, HashMap<String, CancellationToken>>>,
}

impl NodeExecutor {
    pub fn new(
        sandbox: Sandbox,
        credentials: Arc<dyn CredentialVault>,
        runtime: Option<Arc<dyn NodeRuntime>>,
        http_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| EngineError::Collaborator(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            sandbox,
            http: HttpClient::new(client, credentials),
            runtime,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Runs `node` once on `inputs`.
    ///
    /// Returns [`EngineError::NodeCanceled`] as soon as `cancel` fires, without
    /// waiting for the behavior to notice.
    pub async fn execute_node(
        &self,
        node: &Node,
        inputs: PortItems,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput> {
        let token = cancel.child_token();
        self.in_flight
            .lock()
            .entry(context.execution_id.clone())
            .or_default()
            .insert(node.id.clone(), token.clone());

        tracing::debug!(node_id = %node.id, node_type = %node.node_type, execution_id = %context.execution_id, "⚙️ Executing node");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(EngineError::NodeCanceled(node.id.clone())),
            result = self.dispatch(node, inputs, context, &token) => result,
        };

        let mut in_flight = self.in_flight.lock();
        if let Some(nodes) = in_flight.get_mut(&context.execution_id) {
            nodes.remove(&node.id);
            if nodes.is_empty() {
                in_flight.remove(&context.execution_id);
            }
        }
        result
    }

    async fn dispatch(
        &self,
        node: &Node,
        inputs: PortItems,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput> {
        let exprs = Expressions::new(&self.sandbox, context, node);
        match &node.node_type {
            NodeType::Start
            | NodeType::ManualTrigger
            | NodeType::CronTrigger
            | NodeType::IntervalTrigger
            | NodeType::WebhookTrigger
            | NodeType::PollingTrigger => Ok(nodes::start::run(node, inputs).into()),
            NodeType::Set => nodes::set::run(&exprs, node, inputs).await.map(Into::into),
            NodeType::If => nodes::branch::run_if(&exprs, node, inputs).await.map(Into::into),
            NodeType::Switch => nodes::branch::run_switch(&exprs, node, inputs).await.map(Into::into),
            NodeType::Merge => nodes::merge::run(node, inputs).map(Into::into),
            NodeType::Code => nodes::code::run(&self.sandbox, node, inputs, context, cancel).await,
            NodeType::HttpRequest => self.http.run(&exprs, node, inputs, context).await.map(Into::into),
            NodeType::Custom(name) => self.execute_custom(name, node, inputs, context).await,
        }
    }

    /// Delegates unknown node types to the external runtime.
    async fn execute_custom(
        &self,
        node_type: &str,
        node: &Node,
        inputs: PortItems,
        context: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            EngineError::node(&node.id, format!("No node runtime configured for type '{node_type}'"))
        })?;

        let request = RuntimeRequest {
            node_type: node_type.to_string(),
            parameters: node.parameters.clone(),
            input_data: nodes::flatten_inputs(inputs),
            execution_id: context.execution_id.clone(),
            node_id: node.id.clone(),
            context: RuntimeContext {
                workflow_id: context.workflow_id.clone(),
                mode: context.mode.as_str().to_string(),
                user_id: context.user_id.clone(),
                variables: context.variables.clone(),
            },
        };

        let response = runtime
            .execute(request)
            .await
            .map_err(|e| match e {
                EngineError::NodeExecution { .. } => e,
                other => EngineError::node(&node.id, other),
            })?;
        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| "Node runtime reported failure".to_string());
            return Err(EngineError::node(&node.id, message));
        }
        Ok(vec![response.output_data].into())
    }

    /// Cancels every running node of an execution. Returns how many were signalled.
    pub fn cancel_execution(&self, execution_id: &str) -> usize {
        let nodes = self.in_flight.lock().remove(execution_id).unwrap_or_default();
        for (node_id, token) in &nodes {
            tracing::debug!(%execution_id, %node_id, "🛑 Canceling node");
            token.cancel();
        }
        nodes.len()
    }

    /// Ids of nodes currently running for an execution.
    pub fn in_flight(&self, execution_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .in_flight
            .lock()
            .get(execution_id)
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
