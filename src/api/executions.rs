/// Execution REST API endpoints
///
/// Start, stop, retry and inspect executions. Synchronous runs answer with the
/// output of the last node; `"async": true` answers as soon as the run started.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};
use crate::error::EngineError;
use crate::runtime::{ExecutionRecord, ExecutionRequest, RetryRequest};

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", post(execute))
        .route("/api/executions/active", get(list_active))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/status", get(get_status))
        .route("/api/executions/{id}/context", get(get_context))
        .route("/api/executions/{id}/stop", put(stop_execution))
        .route("/api/executions/{id}/retry", post(retry_execution))
}

/// POST /api/executions
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("📥 Execution requested for workflow {} ({})", request.workflow_id, request.source);
    let run_async = request.run_async;
    let summary = state.engine.execute(request).await?;
    if run_async {
        return Ok(Json(json!({ "executionId": summary.execution_id, "status": summary.status })));
    }
    let record = state
        .engine
        .get_execution(&summary.execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound(summary.execution_id.clone()))?;
    Ok(Json(finished_body(&record)))
}

/// PUT /api/executions/{id}/stop
async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Stopped by user".to_string());
    let accepted = state.engine.stop(&id, reason)?;
    Ok(Json(json!({ "executionId": id, "accepted": accepted })))
}

/// POST /api/executions/{id}/retry
async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let summary = state.engine.retry(&id, request).await?;
    Ok(Json(json!({
        "retryOf": id,
        "newExecutionId": summary.execution_id,
        "status": summary.status,
    })))
}

/// GET /api/executions/{id}/status
async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let status = state
        .engine
        .get_status(&id)
        .ok_or(EngineError::ExecutionNotFound(id.clone()))?;
    Ok(Json(json!({ "executionId": id, "status": status })))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    state
        .engine
        .get_execution(&id)
        .map(Json)
        .ok_or_else(|| EngineError::ExecutionNotFound(id).into())
}

/// GET /api/executions/{id}/context
async fn get_context(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let view = state
        .engine
        .get_context(&id)
        .ok_or(EngineError::ExecutionNotFound(id))?;
    Ok(Json(json!(view)))
}

/// GET /api/executions/active
async fn list_active(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "executions": state.engine.active_executions() }))
}

pub(crate) fn finished_body(record: &ExecutionRecord) -> Value {
    let mut body = json!({
        "executionId": record.execution_id,
        "status": record.status,
        "data": record.last_node_output,
    });
    if let Some(error) = &record.error {
        body["error"] = json!(error);
    }
    body
}
