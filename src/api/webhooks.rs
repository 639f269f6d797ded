/// Webhook execution endpoints
///
/// Every request under /webhook/ is looked up in the trigger route table, so
/// routes follow trigger activation without rebuilding the router.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::any,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::api::{executions::finished_body, ApiError, AppState};
use crate::runtime::ExecutionStatus;
use crate::trigger::{RouteMatch, WebhookReply, WebhookRequest};

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{*path}", any(execute_webhook))
}

/// ANY /webhook/{path}
/// Body: JSON payload (anything else is passed on as a string)
async fn execute_webhook(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    tracing::info!("📥 Webhook request received: {} /{}", method, path);

    let route = match state.orchestrator.routes().lookup(method.as_str(), &path) {
        RouteMatch::Found(route) => route,
        RouteMatch::MethodNotAllowed => {
            tracing::warn!("❌ Webhook /{} does not accept {}", path, method);
            return Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
        }
        RouteMatch::NotFound => {
            tracing::warn!("❌ No active webhook for /{}", path);
            return Ok(error_response(StatusCode::NOT_FOUND, "Webhook not registered"));
        }
    };

    let payload = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&body).unwrap_or_else(|e| {
            tracing::debug!("📄 Webhook body is not JSON ({}), passing it as text", e);
            Value::String(body)
        })
    };

    let request = WebhookRequest {
        method: method.to_string(),
        path,
        headers,
        query,
        body: payload,
    };
    let reply = state.orchestrator.handle_webhook(&route, request).await?;

    Ok(match reply {
        WebhookReply::Started { execution_id } => Json(json!({
            "executionId": execution_id,
            "message": "Workflow was started",
        }))
        .into_response(),
        WebhookReply::Finished(record) => {
            let status = match record.status {
                ExecutionStatus::Success => StatusCode::OK,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(finished_body(&record))).into_response()
        }
        WebhookReply::Pending { execution_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "executionId": execution_id, "status": ExecutionStatus::Running })),
        )
            .into_response(),
        WebhookReply::Paused => error_response(StatusCode::SERVICE_UNAVAILABLE, "Webhook trigger is paused"),
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
