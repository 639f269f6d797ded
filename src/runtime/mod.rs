/// Runtime Execution Engine
///
/// Everything that happens while a workflow runs:
/// - Graph view of a workflow and data-flow traversal
/// - Node behaviors and the sandboxed Lua runtime
/// - Error policy, execution contexts, records and lifecycle events

// Per-execution context store
pub mod context;

// Data-flow execution engine
pub mod engine;

// Lifecycle event broadcast
pub mod events;

// Single node dispatch and cancellation
pub mod executor;

// Expression parsing, comparisons and routing helpers
pub mod flow;

// petgraph view of a workflow
pub mod graph;

// Built-in node behaviors
pub mod nodes;

// Retry, continue and fallback decisions
pub mod policy;

// Execution records and steps
pub mod record;

// Sandboxed Lua runtime
pub mod sandbox;

// Re-export main types
pub use context::{ContextView, ExecutionContext, ExecutionMode};
pub use engine::{ExecutionOptions, ExecutionRequest, ExecutionSummary, RetryRequest, WorkflowExecutionEngine};
pub use events::{EventBus, ExecutionEvent};
pub use executor::NodeExecutor;
pub use record::{ExecutionRecord, ExecutionStatus, ExecutionStep, StepStatus};
pub use sandbox::Sandbox;
