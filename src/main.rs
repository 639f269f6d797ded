/// Mechaway: workflow automation engine
///
/// Main entry point. Loads configuration from the environment and starts the
/// HTTP server with execution, trigger and workflow APIs.

use mechaway_engine::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Execution API at /api/executions/*
/// - Trigger API at /api/triggers/*
/// - Workflow deployment API at /api/workflows/*
/// - Webhook ingress at /webhook/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to localhost:3004 and ./data/mechaway.db)
    let config = Config::default();

    start_server(config).await
}
