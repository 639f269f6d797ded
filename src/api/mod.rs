/// HTTP API Layer
///
/// REST endpoints for executions, triggers and workflow deployment, plus the
/// webhook ingress that feeds webhook triggers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::{EngineError, TriggerError};
use crate::runtime::WorkflowExecutionEngine;
use crate::trigger::TriggerOrchestrator;
use crate::workflow::WorkflowRegistry;

// Execution lifecycle endpoints (execute/stop/retry/status/context)
pub mod executions;

// Trigger lifecycle endpoints
pub mod triggers;

// Webhook ingress backed by the trigger route table
pub mod webhooks;

// Workflow deployment endpoints (PUT/GET/DELETE)
pub mod workflows;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowExecutionEngine>,
    pub orchestrator: Arc<TriggerOrchestrator>,
    pub registry: Arc<WorkflowRegistry>,
}

/// Full router: health check plus every API surface
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(executions::create_execution_routes())
        .merge(triggers::create_trigger_routes())
        .merge(workflows::create_workflow_routes())
        .merge(webhooks::create_webhook_routes())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

/// Engine error rendered as `{"error": ...}` with a matching status code
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) | EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::WorkflowNotFound(_) | EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Trigger(err) => match err {
                TriggerError::Validation(_) => StatusCode::BAD_REQUEST,
                TriggerError::Unauthorized => StatusCode::UNAUTHORIZED,
                TriggerError::NotFound(_) => StatusCode::NOT_FOUND,
                TriggerError::InvalidTransition { .. } => StatusCode::CONFLICT,
                TriggerError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
                TriggerError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        } else {
            tracing::debug!("↩️ {} {}", status.as_u16(), self.0);
        }
        let body = match &self.0 {
            EngineError::Validation(errors) | EngineError::Trigger(TriggerError::Validation(errors)) => {
                json!({ "error": self.0.to_string(), "errors": errors })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::Validation(vec!["cycle".into()]), StatusCode::BAD_REQUEST),
            (EngineError::WorkflowNotFound("wf".into()), StatusCode::NOT_FOUND),
            (TriggerError::Unauthorized.into(), StatusCode::UNAUTHORIZED),
            (TriggerError::Configuration("bad cron".into()).into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                TriggerError::InvalidTransition {
                    trigger_id: "t".into(),
                    from: "inactive".into(),
                    action: "pause",
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (EngineError::Collaborator("db down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
