//! Collaborator contracts the engine and orchestrator depend on
//!
//! Each concern sits behind an async trait so deployments can swap the
//! in-process implementations here for real backends.

pub mod credentials;
pub mod history;
pub mod node_runtime;
pub mod repository;
pub mod variables;

pub use credentials::{CredentialVault, StaticCredentialVault};
pub use history::{ExecutionHistory, NoopHistory, SqliteHistory};
pub use node_runtime::{HttpNodeRuntime, NodeRuntime, RuntimeContext, RuntimeRequest, RuntimeResponse};
pub use repository::WorkflowRepository;
pub use variables::{LayeredVariables, VariableResolver, VariableScope};
