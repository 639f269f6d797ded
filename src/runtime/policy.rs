//! Error policy: decides between retry, continue, fallback and failure
//!
//! Retry counters live here, keyed by (execution, node), so they never leak
//! between executions and are dropped when an execution is cleaned up.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::workflow::RetryConfig;

/// Failure handling configured on a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorPolicy {
    pub continue_on_fail: bool,
    pub retry_on_fail: bool,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub fallback_node: Option<String>,
}

impl From<&RetryConfig> for ErrorPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            continue_on_fail: config.continue_on_fail,
            retry_on_fail: config.retry_on_fail,
            max_retries: config.max_retries,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            fallback_node: config.fallback_node.clone(),
        }
    }
}

/// What to do with a failed node attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub should_retry: bool,
    pub should_continue: bool,
    /// Retries granted so far, including this one
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Set only when neither retry nor continue applies
    pub fallback_node: Option<String>,
}

impl PolicyDecision {
    /// The failure ends the execution.
    pub fn is_fatal(&self) -> bool {
        !self.should_retry && !self.should_continue && self.fallback_node.is_none()
    }
}

/// Tracks retry counts and turns policies into decisions
#[derive(Default)]
pub struct ErrorPolicyEngine {
    retry_counts: Mutex<HashMap<(String, String), u32>>,
}

impl ErrorPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides how to handle a failure of `node_id` in `execution_id`.
    ///
    /// Retry wins while retries remain. Continue applies only once retries are
    /// exhausted. Fallback applies only when neither of those does.
    pub fn decide(&self, execution_id: &str, node_id: &str, policy: &ErrorPolicy) -> PolicyDecision {
        let mut counts = self.retry_counts.lock();
        let count = counts
            .entry((execution_id.to_string(), node_id.to_string()))
            .or_insert(0);

        let should_retry = policy.retry_on_fail && *count < policy.max_retries;
        if should_retry {
            *count += 1;
        }
        let should_continue = policy.continue_on_fail && !should_retry;
        let fallback_node = if should_retry || should_continue {
            None
        } else {
            policy.fallback_node.clone()
        };

        PolicyDecision {
            should_retry,
            should_continue,
            retry_count: *count,
            retry_delay: if should_retry { policy.retry_interval } else { Duration::ZERO },
            fallback_node,
        }
    }

    pub fn retry_count(&self, execution_id: &str, node_id: &str) -> u32 {
        self.retry_counts
            .lock()
            .get(&(execution_id.to_string(), node_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Forgets all counters of an execution.
    pub fn reset_execution(&self, execution_id: &str) {
        self.retry_counts
            .lock()
            .retain(|(exec, _), _| exec != execution_id);
    }
}
