//! Error taxonomy for the engine, the sandbox and the trigger orchestrator.
//!
//! Node-level failures never escape the engine as panics: they are carried as
//! [`EngineError::NodeExecution`] and routed through the error policy. Whether a
//! failure ends up fatal is decided by policy configuration, not by the variant.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the sandboxed script runtime.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// The script exceeded its wall-clock budget and was terminated.
    #[error("Script timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The script was stopped because its execution was canceled.
    #[error("Script was canceled")]
    Canceled,

    /// The script failed to compile.
    #[error("Script compilation failed{}: {message}", line_suffix(*line))]
    Compile { message: String, line: Option<u32> },

    /// The script raised an error while running.
    #[error("Script failed{}: {message}", line_suffix(*line))]
    Runtime { message: String, line: Option<u32> },

    /// The sandbox itself could not be prepared.
    #[error("Sandbox setup failed: {0}")]
    Setup(String),
}

fn line_suffix(line: Option<u32>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

/// Errors raised by trigger registration and lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TriggerError {
    /// A required parameter is missing or malformed. Activation is rejected.
    #[error("Trigger configuration error: {0}")]
    Configuration(String),

    /// Failure while firing. The trigger is moved to Error and torn down.
    #[error("Trigger runtime error: {0}")]
    Runtime(String),

    /// No trigger with the given id is registered.
    #[error("Trigger not found: {0}")]
    NotFound(String),

    /// The requested lifecycle action is not allowed from the current status.
    #[error("Cannot {action} trigger {trigger_id} while it is {from}")]
    InvalidTransition {
        trigger_id: String,
        from: String,
        action: &'static str,
    },

    /// The bound workflow does not validate.
    #[error("Workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Webhook authentication did not match.
    #[error("Webhook authentication failed")]
    Unauthorized,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural workflow defect, surfaced before any run.
    #[error("Workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The workflow does not exist in the repository.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The execution id is unknown (never existed or already evicted).
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// A single node failed.
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// The node was interrupted because its execution was canceled.
    #[error("Node '{0}' was canceled")]
    NodeCanceled(String),

    /// Sandbox failure, converted into a node failure by the executor.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Trigger lifecycle failure.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Unrecoverable failure of a single execution.
    #[error("Execution {execution_id} aborted: {message}")]
    Fatal {
        execution_id: String,
        message: String,
    },

    /// A collaborator (repository, history, vault) failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Builds a node failure from anything printable.
    pub fn node(node_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::NodeExecution {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    /// Error chain as a list of messages, outermost first.
    pub fn chain(&self) -> Vec<String> {
        std::iter::successors(Some(self as &dyn std::error::Error), |err| err.source())
            .map(|err| err.to_string())
            .collect()
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Collaborator(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_error_mentions_line() {
        let err = SandboxError::Compile {
            message: "unexpected symbol".into(),
            line: Some(3),
        };
        assert_eq!(
            err.to_string(),
            "Script compilation failed at line 3: unexpected symbol"
        );

        let err = SandboxError::Runtime {
            message: "boom".into(),
            line: None,
        };
        assert_eq!(err.to_string(), "Script failed: boom");
    }

    #[test]
    fn test_validation_error_joins_messages() {
        let err = EngineError::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Workflow validation failed: a; b");
    }

    #[test]
    fn test_chain_includes_source() {
        let err = EngineError::from(SandboxError::Timeout { timeout_ms: 100 });
        let chain = err.chain();
        assert_eq!(chain[0], "Script timed out after 100ms");
    }
}
