//! Execution lifecycle events
//!
//! Published on a broadcast channel. For a given execution, `Started` always
//! precedes node events, which precede exactly one of `Completed`, `Failed`
//! or `Stopped`.

use serde::Serialize;
use tokio::sync::broadcast;

use super::context::ExecutionMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        execution_id: String,
        workflow_id: String,
        mode: ExecutionMode,
    },
    #[serde(rename_all = "camelCase")]
    NodeStarted {
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        execution_id: String,
        node_id: String,
        items: usize,
    },
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
        will_retry: bool,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        execution_id: String,
        duration_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        execution_id: String,
        message: String,
        chain: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        execution_id: String,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::Completed { execution_id, .. }
            | ExecutionEvent::Failed { execution_id, .. }
            | ExecutionEvent::Stopped { execution_id, .. } => execution_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed { .. } | ExecutionEvent::Failed { .. } | ExecutionEvent::Stopped { .. }
        )
    }
}

/// Broadcast fan-out for lifecycle events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is fine.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_without_subscribers_and_receive() {
        let bus = EventBus::new(8);
        bus.emit(ExecutionEvent::Stopped {
            execution_id: "lost".into(),
            reason: "nobody listening".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(ExecutionEvent::Completed {
            execution_id: "e1".into(),
            duration_ms: 5,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), "e1");
        assert!(event.is_terminal());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "completed", "executionId": "e1", "durationMs": 5})
        );
    }
}
