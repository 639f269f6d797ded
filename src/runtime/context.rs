//! Per-execution context store
//!
//! A context is created when an execution starts and destroyed when it
//! reaches a terminal state. Nodes never hold a reference to it: the engine
//! hands each node a snapshot and folds changes (static data) back in.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::workflow::{Item, WorkflowSettings};

/// Per-key static data edits made by one node; `None` removes the key.
pub type StaticDataPatch = HashMap<String, Option<Value>>;

/// Keys that differ between `before` and `after`.
pub fn static_data_patch(before: &Map<String, Value>, after: &Map<String, Value>) -> StaticDataPatch {
    let mut patch: StaticDataPatch = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), Some(value.clone())))
        .collect();
    for key in before.keys().filter(|key| !after.contains_key(*key)) {
        patch.insert(key.clone(), None);
    }
    patch
}

/// How an execution was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    Manual,
    Trigger,
    Webhook,
    Retry,
    Test,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Manual => "manual",
            ExecutionMode::Trigger => "trigger",
            ExecutionMode::Webhook => "webhook",
            ExecutionMode::Retry => "retry",
            ExecutionMode::Test => "test",
        }
    }
}

/// Everything a node may read about the execution it belongs to
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub mode: ExecutionMode,
    pub source: String,
    pub input_data: Vec<Item>,
    pub variables: Map<String, Value>,
    pub static_data: Map<String, Value>,
    pub settings: WorkflowSettings,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Metadata object exposed to scripts as `execution`.
    pub fn execution_binding(&self) -> Value {
        serde_json::json!({
            "id": self.execution_id,
            "mode": self.mode.as_str(),
            "source": self.source,
            "userId": self.user_id,
            "startedAt": self.started_at.to_rfc3339(),
        })
    }

    /// Metadata object exposed to scripts as `workflow`.
    pub fn workflow_binding(&self) -> Value {
        serde_json::json!({
            "id": self.workflow_id,
            "name": self.workflow_name,
            "timezone": self.settings.timezone,
        })
    }
}

/// Read-only view returned by the context endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextView {
    pub execution_id: String,
    pub variables: Map<String, Value>,
    pub static_data: Map<String, Value>,
    pub settings: WorkflowSettings,
}

/// Registry of live execution contexts
#[derive(Default)]
pub struct ExecutionContextStore {
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl ExecutionContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a context. Execution ids are never reused.
    pub fn create(&self, context: ExecutionContext) -> Result<()> {
        let mut contexts = self.contexts.write();
        if contexts.contains_key(&context.execution_id) {
            return Err(EngineError::InvalidRequest(format!(
                "Execution context {} already exists",
                context.execution_id
            )));
        }
        contexts.insert(context.execution_id.clone(), context);
        Ok(())
    }

    pub fn snapshot(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.contexts.read().get(execution_id).cloned()
    }

    pub fn view(&self, execution_id: &str) -> Option<ContextView> {
        self.contexts.read().get(execution_id).map(|ctx| ContextView {
            execution_id: ctx.execution_id.clone(),
            variables: ctx.variables.clone(),
            static_data: ctx.static_data.clone(),
            settings: ctx.settings.clone(),
        })
    }

    /// Folds a node's static data edits in key by key, so nodes running side
    /// by side keep each other's keys. Returns whether anything changed.
    pub fn apply_static_data(&self, execution_id: &str, patch: StaticDataPatch) -> bool {
        let mut contexts = self.contexts.write();
        let Some(ctx) = contexts.get_mut(execution_id) else {
            return false;
        };
        let mut changed = false;
        for (key, value) in patch {
            changed |= match value {
                Some(value) => ctx.static_data.insert(key, value.clone()).as_ref() != Some(&value),
                None => ctx.static_data.remove(&key).is_some(),
            };
        }
        changed
    }

    pub fn set_variable(&self, execution_id: &str, name: impl Into<String>, value: Value) -> bool {
        match self.contexts.write().get_mut(execution_id) {
            Some(ctx) => {
                ctx.variables.insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    /// Drops the context, handing back its final state.
    pub fn destroy(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.contexts.write().remove(execution_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}
