#![allow(dead_code)]

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use mechaway_engine::api::{create_router, AppState};
use mechaway_engine::config::Config;
use mechaway_engine::runtime::{NodeExecutor, Sandbox, WorkflowExecutionEngine};
use mechaway_engine::services::{LayeredVariables, NoopHistory, StaticCredentialVault, WorkflowRepository};
use mechaway_engine::trigger::TriggerOrchestrator;
use mechaway_engine::workflow::{Workflow, WorkflowRegistry};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<WorkflowExecutionEngine>,
    pub orchestrator: Arc<TriggerOrchestrator>,
}

impl Harness {
    pub async fn new(workflows: Vec<Value>) -> Self {
        Self::with_vault(workflows, StaticCredentialVault::new()).await
    }

    pub async fn with_vault(workflows: Vec<Value>, vault: StaticCredentialVault) -> Self {
        let registry = Arc::new(WorkflowRegistry::in_memory());
        for workflow in workflows {
            let workflow: Workflow = serde_json::from_value(workflow).unwrap();
            registry.register(workflow).await.unwrap();
        }
        let mut config = Config::default();
        config.triggers.min_interval_ms = 10;
        config.triggers.webhook_response_timeout_ms = 5_000;

        let vault = Arc::new(vault);
        let executor = NodeExecutor::new(Sandbox::default(), vault.clone(), None, Duration::from_secs(5)).unwrap();
        let repository: Arc<dyn WorkflowRepository> = registry.clone();
        let engine = Arc::new(WorkflowExecutionEngine::new(
            Arc::clone(&repository),
            Arc::new(executor),
            Arc::new(LayeredVariables::new()),
            Arc::new(NoopHistory),
            &config.engine,
        ));
        let orchestrator = TriggerOrchestrator::new(Arc::clone(&engine), repository, vault, config.triggers.clone())
            .await
            .unwrap();
        orchestrator.start().await.unwrap();
        Self {
            registry,
            engine,
            orchestrator,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            engine: Arc::clone(&self.engine),
            orchestrator: Arc::clone(&self.orchestrator),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Serves the full API on an ephemeral port.
    pub async fn serve(&self) -> String {
        serve(create_router(self.state())).await
    }
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// `POST /echo` answers `{"echoed": <body>}`.
pub async fn echo_server() -> String {
    async fn echo(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({ "echoed": body }))
    }
    serve(Router::new().route("/echo", post(echo))).await
}

/// `GET /state` answers `{"version": n}`; returns the base URL and the counter.
pub async fn versioned_server() -> (String, Arc<AtomicU64>) {
    async fn state(State(version): State<Arc<AtomicU64>>) -> Json<Value> {
        Json(json!({ "version": version.load(Ordering::SeqCst) }))
    }
    let version = Arc::new(AtomicU64::new(1));
    let router = Router::new().route("/state", get(state)).with_state(Arc::clone(&version));
    (serve(router).await, version)
}
