//! Configuration management for the Mechaway engine
//!
//! Every knob has a default and can be overridden with a `MECHAWAY_*`
//! environment variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Workflow and history storage
    pub database: DatabaseConfig,
    /// Execution engine behavior
    pub engine: EngineConfig,
    /// Script runtime budgets
    pub sandbox: SandboxConfig,
    /// Trigger orchestration limits
    pub triggers: TriggerSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the SQLite database file
    pub data_dir: String,
    /// Explicit database URL, overrides `data_dir` when set
    pub url: Option<String>,
}

impl DatabaseConfig {
    /// SQLite URL for workflows and execution history.
    pub fn database_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}/mechaway.db?mode=rwc", self.data_dir),
        }
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of finished execution records kept in memory for status and retry
    pub execution_retention: usize,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
    /// Base URL of the external node runtime used for custom node types
    pub node_runtime_url: Option<String>,
    /// Default timeout for outbound HTTP made by nodes
    pub http_timeout_ms: u64,
}

/// Script runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for Code node scripts
    pub script_timeout_ms: u64,
    /// Wall-clock budget for `{{ }}` expressions
    pub expression_timeout_ms: u64,
    /// Upper bound on memory a single script may allocate
    pub memory_limit_bytes: usize,
}

/// Trigger orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Shortest accepted period for interval and polling triggers
    pub min_interval_ms: u64,
    /// Timeout for a single polling fetch
    pub poll_timeout_ms: u64,
    /// How long a `lastNode` webhook waits for the execution to finish
    pub webhook_response_timeout_ms: u64,
    /// Timezone for cron triggers whose workflow sets none
    pub default_timezone: String,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("MECHAWAY_HOST", "0.0.0.0".to_string()),
                port: env_or("MECHAWAY_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: env_or("MECHAWAY_DATA_DIR", "data".to_string()),
                url: std::env::var("MECHAWAY_DATABASE_URL").ok(),
            },
            engine: EngineConfig::default(),
            sandbox: SandboxConfig::default(),
            triggers: TriggerSettings::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_retention: env_or("MECHAWAY_EXECUTION_RETENTION", 500),
            event_capacity: 1024,
            node_runtime_url: std::env::var("MECHAWAY_NODE_RUNTIME_URL").ok(),
            http_timeout_ms: env_or("MECHAWAY_HTTP_TIMEOUT_MS", 30_000),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            script_timeout_ms: env_or("MECHAWAY_SCRIPT_TIMEOUT_MS", 30_000),
            expression_timeout_ms: env_or("MECHAWAY_EXPRESSION_TIMEOUT_MS", 5_000),
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: env_or("MECHAWAY_MIN_INTERVAL_MS", 1_000),
            poll_timeout_ms: env_or("MECHAWAY_POLL_TIMEOUT_MS", 10_000),
            webhook_response_timeout_ms: env_or("MECHAWAY_WEBHOOK_RESPONSE_TIMEOUT_MS", 30_000),
            default_timezone: env_or("MECHAWAY_TIMEZONE", "UTC".to_string()),
        }
    }
}

/// Reads `key` from the environment, falling back when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
