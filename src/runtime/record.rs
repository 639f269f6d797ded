//! Execution records: what ran, with which items, and how it ended

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::context::ExecutionMode;
use crate::workflow::{Item, PortItems};

/// Overall status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Canceled => "canceled",
        }
    }
}

/// Outcome of a single node attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// One attempt of one node. Steps are append-only, so a retried node shows
/// one `Failed` entry per failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub node_id: String,
    pub status: StepStatus,
    /// 1-based attempt number
    pub attempt: u32,
    pub input: PortItems,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PortItems>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Full record of an execution, live while running and retained afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub mode: ExecutionMode,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub input_data: Vec<Item>,
    pub start_nodes: Vec<String>,
    pub steps: Vec<ExecutionStep>,
    /// Latest successful output per node, reused by partial re-runs
    pub run_data: HashMap<String, PortItems>,
    /// Items produced by the node that finished last
    pub last_node_output: Vec<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        execution_id: String,
        workflow_id: String,
        mode: ExecutionMode,
        source: String,
        user_id: Option<String>,
        input_data: Vec<Item>,
        start_nodes: Vec<String>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            mode,
            source,
            user_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            input_data,
            start_nodes,
            steps: Vec::new(),
            run_data: HashMap::new(),
            last_node_output: Vec::new(),
            error: None,
            error_chain: Vec::new(),
            retry_of: None,
        }
    }

    /// Steps of one node in the order they were recorded.
    pub fn steps_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ExecutionStep> + 'a {
        self.steps.iter().filter(move |step| step.node_id == node_id)
    }

    /// First node whose final attempt failed without producing output.
    pub fn failed_node(&self) -> Option<&str> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
            .map(|step| step.node_id.as_str())
            .find(|node_id| !self.run_data.contains_key(*node_id))
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(node_id: &str, status: StepStatus) -> ExecutionStep {
        ExecutionStep {
            node_id: node_id.into(),
            status,
            attempt: 1,
            input: vec![],
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_node_ignores_continued_failures() {
        let mut record = ExecutionRecord::new(
            "e1".into(),
            "wf".into(),
            ExecutionMode::Manual,
            "test".into(),
            None,
            vec![],
            vec!["start".into()],
        );
        record.steps.push(step("a", StepStatus::Failed));
        // `a` continued on fail and produced an error item
        record.run_data.insert("a".into(), vec![vec![json!({"error": "x"})]]);
        record.steps.push(step("b", StepStatus::Failed));
        assert_eq!(record.failed_node(), Some("b"));
        assert_eq!(record.steps_for("a").count(), 1);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(ExecutionStatus::Canceled).unwrap(), json!("canceled"));
        assert!(ExecutionStatus::Error.is_finished());
        assert!(!ExecutionStatus::Running.is_finished());
    }
}
