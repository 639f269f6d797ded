//! Hot-reload workflow registry using ArcSwap
//!
//! Readers never block: each update clones the map and atomically swaps the
//! pointer, so executions that already loaded a workflow keep their snapshot.
//! The registry is the engine's [`WorkflowRepository`]; when a storage backend
//! is attached every save is written through to SQLite.

use crate::error::{EngineError, Result};
use crate::services::WorkflowRepository;
use crate::workflow::{
    storage::WorkflowStorage,
    types::Workflow,
    validator::{validate, ValidationReport},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// Lock-free workflow registry
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: validated workflow definition
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    /// Optional write-through persistence
    storage: Option<WorkflowStorage>,
    /// Serializes writers; readers go through the ArcSwap
    write_lock: tokio::sync::Mutex<()>,
}

/// Workflow plus what validation found out about it
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    pub report: ValidationReport,
}

impl WorkflowRegistry {
    /// Registry without persistence.
    pub fn in_memory() -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry writing through to SQLite.
    pub fn with_storage(storage: WorkflowStorage) -> Self {
        Self {
            storage: Some(storage),
            ..Self::in_memory()
        }
    }

    /// Populates the registry from storage. Called once at startup.
    pub async fn init_from_storage(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let stored = storage.load_all_workflows().await?;

        let compiled: HashMap<String, CompiledWorkflow> = stored
            .into_iter()
            .map(|workflow| (workflow.id.clone(), compile(workflow)))
            .collect();
        let count = compiled.len();
        self.workflows.store(Arc::new(compiled));

        tracing::info!("📚 Initialized workflow registry with {} workflows", count);
        Ok(count)
    }

    /// Validates and stores a workflow, replacing any previous version.
    ///
    /// Invalid workflows are stored as well (so they can be fixed and listed),
    /// but the report tells the caller they cannot run.
    pub async fn register(&self, workflow: Workflow) -> Result<ValidationReport> {
        let _guard = self.write_lock.lock().await;

        if let Some(storage) = &self.storage {
            storage.save_workflow(&workflow).await?;
        }

        let compiled = compile(workflow);
        let report = compiled.report.clone();
        let id = compiled.workflow.id.clone();

        let current = self.workflows.load();
        let mut next = (**current).clone();
        next.insert(id.clone(), compiled);
        self.workflows.store(Arc::new(next));

        tracing::info!(workflow_id = %id, valid = report.is_valid, "🔄 Hot-reloaded workflow");
        Ok(report)
    }

    /// Lock-free lookup.
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Ids of all registered workflows.
    pub fn list_workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes a workflow from memory and storage.
    pub async fn remove_workflow(&self, workflow_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        if let Some(storage) = &self.storage {
            storage.delete_workflow(workflow_id).await?;
        }

        let current = self.workflows.load();
        let mut next = (**current).clone();
        let removed = next.remove(workflow_id).is_some();
        if removed {
            self.workflows.store(Arc::new(next));
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
        Ok(removed)
    }
}

fn compile(workflow: Workflow) -> CompiledWorkflow {
    let report = validate(&workflow);
    if !report.is_valid {
        tracing::warn!(
            workflow_id = %workflow.id,
            errors = ?report.errors,
            "⚠️ Workflow failed validation"
        );
    }
    CompiledWorkflow {
        workflow: Arc::new(workflow),
        report,
    }
}

#[async_trait]
impl WorkflowRepository for WorkflowRegistry {
    async fn find_by_id(&self, workflow_id: &str) -> Result<Option<Arc<Workflow>>> {
        Ok(self.get_workflow(workflow_id).map(|c| c.workflow))
    }

    async fn find_active(&self) -> Result<Vec<Arc<Workflow>>> {
        let mut active: Vec<Arc<Workflow>> = self
            .workflows
            .load()
            .values()
            .filter(|c| c.workflow.active)
            .map(|c| Arc::clone(&c.workflow))
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn save(&self, workflow: Workflow) -> Result<()> {
        let report = self.register(workflow).await?;
        if report.is_valid {
            Ok(())
        } else {
            Err(EngineError::Validation(report.errors))
        }
    }
}
