use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::workflow::Workflow;

/// Source of workflow definitions.
///
/// The engine only reads through this trait, except for writing back static
/// data after a successful run.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_by_id(&self, workflow_id: &str) -> Result<Option<Arc<Workflow>>>;

    /// Workflows flagged active, whose triggers load at startup.
    async fn find_active(&self) -> Result<Vec<Arc<Workflow>>>;

    async fn save(&self, workflow: Workflow) -> Result<()>;
}
