//! Polling triggers: fetch, diff against the last snapshot, fire on change

use serde_json::{json, Value};
use std::time::Duration;

use crate::error::TriggerError;
use crate::workflow::Item;

use super::types::PollingConfig;

/// What changed between two polls
#[derive(Debug, Clone, PartialEq)]
pub struct PollChange {
    pub changed_paths: Vec<String>,
    pub previous: Value,
    pub current: Value,
}

impl PollChange {
    /// Execution input for a change.
    pub fn into_item(self) -> Item {
        json!({
            "data": self.current,
            "previous": self.previous,
            "changedPaths": self.changed_paths,
        })
    }
}

/// Last snapshot seen by one polling trigger
#[derive(Debug, Default)]
pub struct PollState {
    snapshot: Option<Value>,
}

impl PollState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `current` and reports the change, if any.
    ///
    /// The first observation only records the baseline.
    pub fn observe(&mut self, current: Value) -> Option<PollChange> {
        let Some(previous) = self.snapshot.replace(current.clone()) else {
            tracing::debug!("📸 Polling baseline established");
            return None;
        };
        let changed_paths = diff_paths(&previous, &current);
        if changed_paths.is_empty() {
            return None;
        }
        Some(PollChange {
            changed_paths,
            previous,
            current,
        })
    }

    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }
}

/// Paths (`$.a.b[2]`) whose values differ between `old` and `new`.
///
/// Objects are compared key by key and arrays index by index; anything else
/// is reported at the deepest path where the two documents diverge.
pub fn diff_paths(old: &Value, new: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    walk("$".to_string(), old, new, &mut paths);
    paths
}

fn walk(path: String, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{path}.{key}");
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => walk(child, x, y, out),
                    _ => out.push(child),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for index in 0..a.len().max(b.len()) {
                let child = format!("{path}[{index}]");
                match (a.get(index), b.get(index)) {
                    (Some(x), Some(y)) => walk(child, x, y, out),
                    _ => out.push(child),
                }
            }
        }
        (a, b) if a != b => out.push(path),
        _ => {}
    }
}

/// Fetches the polled endpoint. JSON bodies are parsed, anything else is kept as text.
pub async fn fetch(client: &reqwest::Client, config: &PollingConfig, timeout: Duration) -> Result<Value, TriggerError> {
    let mut request = match config.method.as_str() {
        "POST" => client.post(&config.url),
        _ => client.get(&config.url),
    }
    .timeout(timeout);
    for (name, value) in &config.headers {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        request = request.header(name.as_str(), value);
    }
    if let Some(body) = &config.body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| TriggerError::Runtime(format!("Polling {} failed: {e}", config.url)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TriggerError::Runtime(format!(
            "Polling {} returned status {}",
            config.url,
            status.as_u16()
        )));
    }
    let text = response
        .text()
        .await
        .map_err(|e| TriggerError::Runtime(format!("Failed to read polling response: {e}")))?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_paths() {
        let old = json!({"status": "open", "items": [1, 2], "meta": {"v": 1}});
        let new = json!({"status": "closed", "items": [1, 2, 3], "meta": {"v": 1}, "extra": true});
        assert_eq!(diff_paths(&old, &new), vec!["$.extra", "$.items[2]", "$.status"]);
        assert!(diff_paths(&old, &old).is_empty());
        assert_eq!(diff_paths(&json!(1), &json!("1")), vec!["$"]);
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let mut state = PollState::new();
        assert!(state.observe(json!({"n": 1})).is_none());
        assert!(state.observe(json!({"n": 1})).is_none());

        let change = state.observe(json!({"n": 2})).unwrap();
        assert_eq!(change.changed_paths, vec!["$.n"]);
        assert_eq!(change.previous, json!({"n": 1}));
        assert_eq!(state.snapshot(), Some(&json!({"n": 2})));

        let item = change.into_item();
        assert_eq!(item["data"], json!({"n": 2}));
        assert_eq!(item["changedPaths"], json!(["$.n"]));
    }
}
