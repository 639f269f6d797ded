//! Execution history persistence
//!
//! The engine hands finished records to the history on a spawned task and
//! never waits for it: a slow or failing history must not hold up executions.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

use crate::runtime::ExecutionRecord;

#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    async fn record(&self, record: &ExecutionRecord) -> Result<()>;

    async fn find(&self, execution_id: &str) -> Result<Option<ExecutionRecord>>;
}

/// History that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

#[async_trait]
impl ExecutionHistory for NoopHistory {
    async fn record(&self, _record: &ExecutionRecord) -> Result<()> {
        Ok(())
    }

    async fn find(&self, _execution_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(None)
    }
}

/// SQLite-backed history sharing the workflow database
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                record JSON NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Most recent executions of a workflow, newest first.
    pub async fn list_for_workflow(&self, workflow_id: &str, limit: u32) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT record FROM executions WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let json: String = row.get("record");
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}

#[async_trait]
impl ExecutionHistory for SqliteHistory {
    async fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mode = serde_json::to_value(record.mode)?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, status, mode, started_at, finished_at, record)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                record = excluded.record
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.workflow_id)
        .bind(record.status.as_str())
        .bind(mode.as_str().unwrap_or_default())
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.map(|t| t.to_rfc3339()))
        .bind(&json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT record FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.get("record");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionMode, ExecutionStatus};
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_record_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("h.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        let history = SqliteHistory::new(pool).await.unwrap();

        let mut record = ExecutionRecord::new(
            "exec-1".into(),
            "wf".into(),
            ExecutionMode::Manual,
            "test".into(),
            None,
            vec![],
            vec![],
        );
        history.record(&record).await.unwrap();

        record.status = ExecutionStatus::Success;
        history.record(&record).await.unwrap();

        let found = history.find("exec-1").await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Success);
        assert_eq!(history.list_for_workflow("wf", 10).await.unwrap().len(), 1);
        assert!(history.find("nope").await.unwrap().is_none());
    }
}
