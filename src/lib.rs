/// Mechaway: workflow automation engine
///
/// Trigger orchestration, data-flow DAG execution with per-node error
/// policies, and a sandboxed Lua runtime for Code nodes and expressions.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow management layer - definitions, validation, storage and registry
pub mod workflow;

// Collaborator contracts - repository, credentials, variables, history, node runtime
pub mod services;

// Runtime execution engine - petgraph DAG execution and node orchestration
pub mod runtime;

// Trigger orchestration - cron, interval, polling, webhook and manual triggers
pub mod trigger;

// HTTP API layer - REST endpoints and webhook ingress
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, Result, SandboxError, TriggerError};
pub use runtime::{ExecutionRecord, ExecutionRequest, ExecutionStatus, WorkflowExecutionEngine};
pub use server::start_server;
pub use trigger::TriggerOrchestrator;
pub use workflow::{Connection, Node, NodeType, Workflow};
