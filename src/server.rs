/// Server setup and initialization
///
/// Wires together all components: storage, registry, execution engine,
/// trigger orchestrator and HTTP routes.

use crate::{
    api::{create_router, AppState},
    config::Config,
    runtime::{NodeExecutor, Sandbox, WorkflowExecutionEngine},
    services::{
        CredentialVault, ExecutionHistory, HttpNodeRuntime, LayeredVariables, NodeRuntime, SqliteHistory,
        StaticCredentialVault, WorkflowRepository,
    },
    trigger::TriggerOrchestrator,
    workflow::{WorkflowRegistry, WorkflowStorage},
};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// How long in-flight executions get to settle on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Initializes every component and wires them into the shared API state.
///
/// The cron scheduler is started and the triggers of active workflows are
/// loaded before this returns.
pub async fn build_state(config: &Config, credentials: Arc<dyn CredentialVault>) -> Result<AppState> {
    // Ensure data directory exists
    if config.database.url.is_none() {
        tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
        std::fs::create_dir_all(&config.database.data_dir)
            .with_context(|| format!("Failed to create data directory {}", config.database.data_dir))?;
    }

    // Workflow storage and hot-reload registry
    tracing::info!("📋 Initializing workflow storage");
    let storage = WorkflowStorage::connect(&config.database.database_url())
        .await
        .context("Failed to open workflow database")?;
    let history: Arc<dyn ExecutionHistory> = Arc::new(
        SqliteHistory::new(storage.pool().clone())
            .await
            .context("Failed to prepare execution history")?,
    );
    let registry = Arc::new(WorkflowRegistry::with_storage(storage));
    tracing::info!("📥 Loading existing workflows from storage");
    registry.init_from_storage().await?;

    // Execution components
    tracing::info!("⚙️ Initializing node executor");
    let http_timeout = Duration::from_millis(config.engine.http_timeout_ms);
    let runtime: Option<Arc<dyn NodeRuntime>> = match &config.engine.node_runtime_url {
        Some(url) => {
            tracing::info!("🔌 Custom nodes run on {}", url);
            Some(Arc::new(HttpNodeRuntime::new(url, http_timeout)?))
        }
        None => None,
    };
    let executor = NodeExecutor::new(Sandbox::new(&config.sandbox), Arc::clone(&credentials), runtime, http_timeout)?;

    tracing::info!("🚀 Initializing execution engine");
    let repository: Arc<dyn WorkflowRepository> = registry.clone();
    let engine = Arc::new(WorkflowExecutionEngine::new(
        Arc::clone(&repository),
        Arc::new(executor),
        Arc::new(LayeredVariables::new()),
        history,
        &config.engine,
    ));

    // Trigger orchestration
    tracing::info!("⏰ Initializing trigger orchestrator");
    let orchestrator =
        TriggerOrchestrator::new(Arc::clone(&engine), repository, credentials, config.triggers.clone()).await?;
    orchestrator.start().await?;

    Ok(AppState {
        engine,
        orchestrator,
        registry,
    })
}

/// Create the main Axum application with all routes
pub async fn create_app(config: &Config) -> Result<(Router, AppState)> {
    let state = build_state(config, Arc::new(StaticCredentialVault::from_env())).await?;
    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = create_router(state.clone());
    tracing::info!("✅ Application initialized successfully");
    Ok((router, state))
}

/// Start the HTTP server with the given configuration
///
/// Runs until ctrl-c, then deactivates every trigger and stops the executions
/// still in flight.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mechaway_engine=info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Mechaway engine...");
    let (app, state) = create_app(&config).await?;

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("⏹️ Shutting down");
    state.orchestrator.shutdown().await;
    state.engine.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("👋 Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
