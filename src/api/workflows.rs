/// Workflow deployment REST API endpoints
///
/// Deploying a workflow hot-reloads it into the registry and re-syncs its
/// triggers in the same request, so a deploy never needs a restart.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};
use crate::error::EngineError;
use crate::workflow::Workflow;

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows))
        .route(
            "/api/workflows/{id}",
            put(deploy_workflow).get(get_workflow).delete(delete_workflow),
        )
}

/// Store a workflow and re-sync its triggers
///
/// PUT /api/workflows/{id}
/// Body: { "id": "...", "name": "...", "nodes": [...], "connections": [...] }
async fn deploy_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut workflow): Json<Workflow>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    // Ensure the workflow ID matches the URL parameter
    workflow.id = id.clone();
    let active = workflow.active;

    // STEP 1: Hot-reload into the registry (invalid definitions are kept so they can be fixed)
    let report = state.registry.register(workflow).await?;
    if !report.is_valid {
        let removed = state.orchestrator.remove_workflow_triggers(&id).await;
        tracing::warn!("❌ Workflow {} is invalid, {} triggers taken down", id, removed);
        return Err(EngineError::Validation(report.errors).into());
    }

    // STEP 2: Bring triggers in line with the new definition
    let triggers = state.orchestrator.sync_workflow(&id).await?;
    tracing::info!("🔥 Deployed workflow {} (active: {}, {} triggers)", id, active, triggers.len());

    Ok((
        StatusCode::OK,
        Json(json!({
            "id": id,
            "active": active,
            "warnings": report.warnings,
            "triggers": triggers,
        })),
    ))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    let workflows: Vec<Value> = state
        .registry
        .list_workflow_ids()
        .into_iter()
        .filter_map(|id| state.registry.get_workflow(&id))
        .map(|compiled| {
            json!({
                "id": compiled.workflow.id,
                "name": compiled.workflow.name,
                "active": compiled.workflow.active,
                "version": compiled.workflow.version,
                "valid": compiled.report.is_valid,
            })
        })
        .collect();
    Json(json!({ "workflows": workflows }))
}

/// GET /api/workflows/{id}
async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let compiled = state
        .registry
        .get_workflow(&id)
        .ok_or(EngineError::WorkflowNotFound(id))?;
    Ok(Json(json!({
        "workflow": compiled.workflow.as_ref(),
        "validation": compiled.report,
    })))
}

/// Remove a workflow and its triggers
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    // Triggers go first
    let removed_triggers = state.orchestrator.remove_workflow_triggers(&id).await;
    if !state.registry.remove_workflow(&id).await? {
        return Err(EngineError::WorkflowNotFound(id).into());
    }
    tracing::info!("🗑️ Deleted workflow {} and {} triggers", id, removed_triggers);
    Ok(Json(json!({ "message": "Workflow deleted", "removedTriggers": removed_triggers })))
}
