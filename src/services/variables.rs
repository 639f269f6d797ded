//! Variable resolution with global < workflow < execution precedence

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::Result;

/// What an execution asks variables for.
#[derive(Debug, Clone, Copy)]
pub struct VariableScope<'a> {
    pub workflow_id: &'a str,
    pub user_id: Option<&'a str>,
    /// Variables supplied with the execution request; highest precedence
    pub execution: &'a Map<String, Value>,
}

#[async_trait]
pub trait VariableResolver: Send + Sync {
    async fn resolve(&self, scope: VariableScope<'_>) -> Result<Map<String, Value>>;
}

/// In-memory resolver layering global and per-workflow variables
#[derive(Default)]
pub struct LayeredVariables {
    global: RwLock<Map<String, Value>>,
    per_workflow: RwLock<HashMap<String, Map<String, Value>>>,
}

impl LayeredVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        self.global.write().insert(name.into(), value);
    }

    pub fn set_for_workflow(&self, workflow_id: impl Into<String>, name: impl Into<String>, value: Value) {
        self.per_workflow
            .write()
            .entry(workflow_id.into())
            .or_default()
            .insert(name.into(), value);
    }
}

#[async_trait]
impl VariableResolver for LayeredVariables {
    async fn resolve(&self, scope: VariableScope<'_>) -> Result<Map<String, Value>> {
        let mut resolved = self.global.read().clone();
        if let Some(workflow_vars) = self.per_workflow.read().get(scope.workflow_id) {
            resolved.extend(workflow_vars.clone());
        }
        resolved.extend(scope.execution.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_precedence() {
        let vars = LayeredVariables::new();
        vars.set_global("region", json!("eu"));
        vars.set_global("tier", json!("free"));
        vars.set_for_workflow("wf", "tier", json!("pro"));
        vars.set_for_workflow("other", "tier", json!("ignored"));

        let mut execution = Map::new();
        execution.insert("region".into(), json!("us"));

        let resolved = vars
            .resolve(VariableScope {
                workflow_id: "wf",
                user_id: None,
                execution: &execution,
            })
            .await
            .unwrap();
        assert_eq!(resolved["region"], json!("us"));
        assert_eq!(resolved["tier"], json!("pro"));
    }
}
