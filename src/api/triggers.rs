/// Trigger REST API endpoints
///
/// Registration, lifecycle actions and listing for trigger records.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};
use crate::error::TriggerError;
use crate::trigger::{TriggerAction, TriggerFilter, TriggerRecord, TriggerRegistration};
use crate::workflow::Item;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireRequest {
    #[serde(default)]
    pub input_data: Option<Vec<Item>>,
}

pub fn create_trigger_routes() -> Router<AppState> {
    Router::new()
        .route("/api/triggers", post(register_trigger).get(list_triggers))
        .route("/api/triggers/{id}", get(get_trigger).delete(delete_trigger))
        .route("/api/triggers/{id}/activate", post(activate_trigger))
        .route("/api/triggers/{id}/deactivate", post(deactivate_trigger))
        .route("/api/triggers/{id}/pause", post(pause_trigger))
        .route("/api/triggers/{id}/resume", post(resume_trigger))
        .route("/api/triggers/{id}/fire", post(fire_trigger))
}

/// POST /api/triggers
async fn register_trigger(
    State(state): State<AppState>,
    Json(registration): Json<TriggerRegistration>,
) -> Result<Json<Value>, ApiError> {
    let trigger_id = state.orchestrator.register(registration).await?;
    Ok(Json(json!({ "triggerId": trigger_id })))
}

/// POST /api/triggers/{id}/activate
async fn activate_trigger(state: State<AppState>, id: Path<String>) -> Result<Json<TriggerRecord>, ApiError> {
    lifecycle(state, id, TriggerAction::Activate).await
}

/// POST /api/triggers/{id}/deactivate
async fn deactivate_trigger(state: State<AppState>, id: Path<String>) -> Result<Json<TriggerRecord>, ApiError> {
    lifecycle(state, id, TriggerAction::Deactivate).await
}

/// POST /api/triggers/{id}/pause
async fn pause_trigger(state: State<AppState>, id: Path<String>) -> Result<Json<TriggerRecord>, ApiError> {
    lifecycle(state, id, TriggerAction::Pause).await
}

/// POST /api/triggers/{id}/resume
async fn resume_trigger(state: State<AppState>, id: Path<String>) -> Result<Json<TriggerRecord>, ApiError> {
    lifecycle(state, id, TriggerAction::Resume).await
}

async fn lifecycle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    action: TriggerAction,
) -> Result<Json<TriggerRecord>, ApiError> {
    tracing::debug!(trigger_id = %id, "🎛️ Trigger {} requested", action.as_str());
    let orchestrator = &state.orchestrator;
    let record = match action {
        TriggerAction::Activate => orchestrator.activate(&id).await?,
        TriggerAction::Deactivate => orchestrator.deactivate(&id).await?,
        TriggerAction::Pause => orchestrator.pause(&id).await?,
        TriggerAction::Resume => orchestrator.resume(&id).await?,
    };
    Ok(Json(record))
}

/// POST /api/triggers/{id}/fire
async fn fire_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<FireRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let summary = state.orchestrator.fire_manual(&id, request.input_data).await?;
    Ok(Json(json!({ "executionId": summary.execution_id, "status": summary.status })))
}

/// GET /api/triggers?workflowId=&type=&status=
async fn list_triggers(
    State(state): State<AppState>,
    Query(filter): Query<TriggerFilter>,
) -> Json<Value> {
    Json(json!({ "triggers": state.orchestrator.list(&filter) }))
}

/// GET /api/triggers/{id}
async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TriggerRecord>, ApiError> {
    state
        .orchestrator
        .get(&id)
        .map(Json)
        .ok_or_else(|| TriggerError::NotFound(id).into())
}

/// DELETE /api/triggers/{id}
async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.orchestrator.unregister(&id).await {
        Ok(Json(json!({ "message": "Trigger removed" })))
    } else {
        Err(TriggerError::NotFound(id).into())
    }
}
