//! Trigger records, lifecycle states and per-type configuration
//!
//! The lifecycle is a small state machine:
//!
//! ```text
//! Inactive --activate--> Active --deactivate--> Inactive
//! Active   --pause-----> Paused --resume------> Active
//! any      --recordError--> Error --activate--> Active
//! ```

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::TriggerError;

/// Kind of standing registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerType {
    Cron,
    Interval,
    Webhook,
    Polling,
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::Interval => "interval",
            TriggerType::Webhook => "webhook",
            TriggerType::Polling => "polling",
            TriggerType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerStatus {
    Inactive,
    Active,
    Paused,
    Error,
}

impl TriggerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerStatus::Inactive => "inactive",
            TriggerStatus::Active => "active",
            TriggerStatus::Paused => "paused",
            TriggerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operations driven through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Activate,
    Deactivate,
    Pause,
    Resume,
}

impl TriggerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerAction::Activate => "activate",
            TriggerAction::Deactivate => "deactivate",
            TriggerAction::Pause => "pause",
            TriggerAction::Resume => "resume",
        }
    }
}

/// Status after applying `action` to a trigger in status `from`.
///
/// Error is left only through a fresh activate.
pub fn transition(
    trigger_id: &str,
    from: TriggerStatus,
    action: TriggerAction,
) -> Result<TriggerStatus, TriggerError> {
    use TriggerAction::*;
    use TriggerStatus::*;

    match (from, action) {
        (Inactive | Error, Activate) => Ok(Active),
        (Active | Paused, Deactivate) => Ok(Inactive),
        (Active, Pause) => Ok(Paused),
        (Paused, Resume) => Ok(Active),
        (from, action) => Err(TriggerError::InvalidTransition {
            trigger_id: trigger_id.to_string(),
            from: from.to_string(),
            action: action.as_str(),
        }),
    }
}

/// A trigger bound to one trigger node of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub status: TriggerStatus,
    pub configuration: Value,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub next_trigger_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Body of a trigger registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRegistration {
    pub workflow_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Defaults to the trigger node's parameters
    #[serde(default)]
    pub configuration: Option<Value>,
}

/// Listing filter; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFilter {
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default, rename = "type")]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub status: Option<TriggerStatus>,
}

impl TriggerFilter {
    pub fn matches(&self, record: &TriggerRecord) -> bool {
        self.workflow_id.as_deref().map_or(true, |id| id == record.workflow_id)
            && self.trigger_type.map_or(true, |t| t == record.trigger_type)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Where a fire came from, used as the execution `source`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireSource {
    Cron,
    Interval,
    Polling,
    Webhook,
    Manual,
}

impl FireSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FireSource::Cron => "cron",
            FireSource::Interval => "interval",
            FireSource::Polling => "polling",
            FireSource::Webhook => "webhook",
            FireSource::Manual => "manual",
        }
    }
}

fn config_error(message: impl Into<String>) -> TriggerError {
    TriggerError::Configuration(message.into())
}

fn text<'a>(config: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| config.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Reads a period either as `intervalMs` or as `interval` plus `unit`.
fn period(config: &Value) -> Result<Option<Duration>, TriggerError> {
    if let Some(ms) = config.get("intervalMs") {
        let ms = ms
            .as_u64()
            .ok_or_else(|| config_error("'intervalMs' must be a positive integer"))?;
        return Ok(Some(Duration::from_millis(ms)));
    }
    let Some(amount) = config.get("interval") else {
        return Ok(None);
    };
    let amount = amount
        .as_u64()
        .ok_or_else(|| config_error("'interval' must be a positive integer"))?;
    let factor = match config.get("unit").and_then(Value::as_str).unwrap_or("seconds") {
        "milliseconds" | "ms" => 1,
        "seconds" | "s" => 1_000,
        "minutes" | "m" => 60_000,
        "hours" | "h" => 3_600_000,
        other => return Err(config_error(format!("Unknown interval unit '{other}'"))),
    };
    Ok(Some(Duration::from_millis(amount.saturating_mul(factor))))
}

fn checked_period(config: &Value, min: Duration) -> Result<Duration, TriggerError> {
    let every = period(config)?.ok_or_else(|| config_error("Missing 'intervalMs' parameter"))?;
    if every < min {
        return Err(config_error(format!(
            "Interval of {}ms is below the minimum of {}ms",
            every.as_millis(),
            min.as_millis()
        )));
    }
    Ok(every)
}

/// Cron trigger configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CronConfig {
    /// Six or seven field expression (seconds first)
    pub expression: String,
    pub timezone: Tz,
}

impl CronConfig {
    /// `fallback_timezone` applies when the node sets none (workflow setting,
    /// then process default).
    pub fn parse(config: &Value, fallback_timezone: &str) -> Result<Self, TriggerError> {
        let raw = text(config, &["expression", "cronExpression", "schedule"])
            .ok_or_else(|| config_error("CronTrigger missing 'expression' parameter"))?;
        let expression = super::schedule::normalize_cron_expression(raw)?;
        let timezone = super::schedule::parse_timezone(text(config, &["timezone"]).unwrap_or(fallback_timezone))?;
        Ok(Self { expression, timezone })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalConfig {
    pub every: Duration,
}

impl IntervalConfig {
    pub fn parse(config: &Value, min: Duration) -> Result<Self, TriggerError> {
        Ok(Self {
            every: checked_period(config, min)?,
        })
    }
}

/// Polling trigger configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    pub url: String,
    pub method: String,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
    pub every: Duration,
}

impl PollingConfig {
    pub fn parse(config: &Value, min: Duration) -> Result<Self, TriggerError> {
        let url = text(config, &["url"]).ok_or_else(|| config_error("PollingTrigger missing 'url' parameter"))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(config_error(format!("Polling url '{url}' must be http(s)")));
        }
        let method = text(config, &["method"]).unwrap_or("GET").to_uppercase();
        if !matches!(method.as_str(), "GET" | "POST") {
            return Err(config_error(format!("Polling method '{method}' is not supported")));
        }
        Ok(Self {
            url: url.to_string(),
            method,
            headers: config
                .get("headers")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            body: config.get("body").cloned(),
            every: checked_period(config, min)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseMode {
    /// Reply as soon as the execution started
    OnReceived,
    /// Reply with the last node's output once the execution finished
    LastNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuth {
    None,
    /// Credential holds `user` and `password`
    Basic { credential_id: String },
    /// Credential holds header `name` and expected `value`
    Header { credential_id: String },
}

/// Webhook trigger configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub method: String,
    /// Normalized, always starts with `/` and has no trailing slash
    pub path: String,
    pub response_mode: ResponseMode,
    pub auth: WebhookAuth,
}

impl WebhookConfig {
    pub fn parse(config: &Value) -> Result<Self, TriggerError> {
        let raw_path = text(config, &["path"]).ok_or_else(|| config_error("WebhookTrigger missing 'path' parameter"))?;
        let method = text(config, &["method", "httpMethod"]).unwrap_or("POST").to_uppercase();
        if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD") {
            return Err(config_error(format!("Unsupported webhook method '{method}'")));
        }
        let response_mode = match text(config, &["responseMode"]).unwrap_or("onReceived") {
            "onReceived" => ResponseMode::OnReceived,
            "lastNode" => ResponseMode::LastNode,
            other => return Err(config_error(format!("Unknown response mode '{other}'"))),
        };
        let credential = || {
            text(config, &["credentialId"])
                .map(str::to_string)
                .ok_or_else(|| config_error("Webhook authentication needs a 'credentialId'"))
        };
        let auth = match text(config, &["authentication"]).unwrap_or("none") {
            "none" => WebhookAuth::None,
            "basicAuth" => WebhookAuth::Basic {
                credential_id: credential()?,
            },
            "headerAuth" => WebhookAuth::Header {
                credential_id: credential()?,
            },
            other => return Err(config_error(format!("Unknown webhook authentication '{other}'"))),
        };
        Ok(Self {
            method,
            path: normalize_path(raw_path),
            response_mode,
            auth,
        })
    }
}

/// `orders/` and `/orders` both become `/orders`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transitions() {
        use TriggerAction::*;
        use TriggerStatus::*;

        assert_eq!(transition("t", Inactive, Activate).unwrap(), Active);
        assert_eq!(transition("t", Active, Pause).unwrap(), Paused);
        assert_eq!(transition("t", Paused, Resume).unwrap(), Active);
        assert_eq!(transition("t", Error, Activate).unwrap(), Active);
        assert_eq!(transition("t", Paused, Deactivate).unwrap(), Inactive);

        let err = transition("t", Error, Resume).unwrap_err();
        assert_eq!(err.to_string(), "Cannot resume trigger t while it is error");
        assert!(transition("t", Inactive, Pause).is_err());
        assert!(transition("t", Error, Deactivate).is_err());
        assert!(transition("t", Active, Activate).is_err());
        assert!(transition("t", Paused, Activate).is_err());
    }

    #[test]
    fn test_interval_minimum_and_units() {
        let min = Duration::from_millis(1_000);
        assert_eq!(
            IntervalConfig::parse(&json!({"interval": 2, "unit": "minutes"}), min).unwrap().every,
            Duration::from_secs(120)
        );
        assert!(matches!(
            IntervalConfig::parse(&json!({"intervalMs": 10}), min),
            Err(TriggerError::Configuration(_))
        ));
        assert!(IntervalConfig::parse(&json!({}), min).is_err());
    }

    #[test]
    fn test_webhook_config() {
        let config = WebhookConfig::parse(&json!({
            "path": "orders/new/",
            "method": "post",
            "responseMode": "lastNode",
            "authentication": "headerAuth",
            "credentialId": "cred-1"
        }))
        .unwrap();
        assert_eq!(config.path, "/orders/new");
        assert_eq!(config.method, "POST");
        assert_eq!(config.response_mode, ResponseMode::LastNode);
        assert_eq!(
            config.auth,
            WebhookAuth::Header {
                credential_id: "cred-1".into()
            }
        );

        assert!(WebhookConfig::parse(&json!({"path": "x", "authentication": "basicAuth"})).is_err());
        assert!(WebhookConfig::parse(&json!({"method": "GET"})).is_err());
    }

    #[test]
    fn test_cron_config_falls_back_to_default_timezone() {
        let config = CronConfig::parse(&json!({"expression": "*/5 * * * *"}), "Europe/Berlin").unwrap();
        assert_eq!(config.expression, "0 */5 * * * *");
        assert_eq!(config.timezone, chrono_tz::Europe::Berlin);

        let err = CronConfig::parse(&json!({"expression": "every tuesday"}), "UTC").unwrap_err();
        assert!(matches!(err, TriggerError::Configuration(_)));
    }

    #[test]
    fn test_filter() {
        let record = TriggerRecord {
            id: "t1".into(),
            workflow_id: "wf".into(),
            node_id: "cron".into(),
            trigger_type: TriggerType::Cron,
            status: TriggerStatus::Active,
            configuration: json!({}),
            last_triggered_at: None,
            next_trigger_at: None,
            trigger_count: 0,
            error_message: None,
            created_at: Utc::now(),
        };
        assert!(TriggerFilter::default().matches(&record));
        let by_type = TriggerFilter {
            trigger_type: Some(TriggerType::Webhook),
            ..Default::default()
        };
        assert!(!by_type.matches(&record));
    }
}
