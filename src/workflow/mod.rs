//! Workflow Management Layer
//!
//! Definitions, structural validation, SQLite persistence and the lock-free
//! hot-reload registry the engine reads from.

// Core workflow type definitions
pub mod types;

// Structural checks run before execution and trigger activation
pub mod validator;

// SQLite persistence layer for workflow storage
pub mod storage;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use storage::WorkflowStorage;
pub use types::{
    Connection, Item, Node, NodeType, PortItems, RetryConfig, Workflow, WorkflowSettings, MAX_NODE_PORTS,
};
pub use validator::{validate, ValidationReport};
