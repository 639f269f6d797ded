//! Webhook route table and request authentication
//!
//! Active webhook triggers claim a `(method, path)` pair here; the ingress
//! router looks requests up in the table instead of registering axum routes at
//! runtime.

use axum::http::{header, HeaderMap};
use base64::Engine as _;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::error::TriggerError;
use crate::services::CredentialVault;
use crate::workflow::Item;

use super::types::{normalize_path, WebhookAuth, WebhookConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: normalize_path(path),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// A live webhook registration
#[derive(Debug, Clone)]
pub struct WebhookRoute {
    pub trigger_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub config: WebhookConfig,
}

/// Result of looking a request up
#[derive(Debug, Clone)]
pub enum RouteMatch {
    Found(WebhookRoute),
    /// The path exists, but not for this method
    MethodNotAllowed,
    NotFound,
}

#[derive(Debug, Default)]
pub struct WebhookRoutes {
    routes: RwLock<HashMap<RouteKey, WebhookRoute>>,
}

impl WebhookRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the route. Fails when another trigger already holds it;
    /// re-registering the same trigger replaces its entry.
    pub fn register(&self, route: WebhookRoute) -> Result<RouteKey, TriggerError> {
        let key = RouteKey::new(&route.config.method, &route.config.path);
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&key) {
            if existing.trigger_id != route.trigger_id {
                return Err(TriggerError::Configuration(format!(
                    "Webhook route {key} is already used by trigger {}",
                    existing.trigger_id
                )));
            }
        }
        routes.retain(|_, existing| existing.trigger_id != route.trigger_id);
        routes.insert(key.clone(), route);
        tracing::debug!("🔗 Registered webhook route {}", key);
        Ok(key)
    }

    /// Drops every route of `trigger_id`. Returns whether any existed.
    pub fn unregister(&self, trigger_id: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, route| route.trigger_id != trigger_id);
        before != routes.len()
    }

    pub fn lookup(&self, method: &str, path: &str) -> RouteMatch {
        let key = RouteKey::new(method, path);
        let routes = self.routes.read();
        if let Some(route) = routes.get(&key) {
            return RouteMatch::Found(route.clone());
        }
        if routes.keys().any(|k| k.path == key.path) {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Checks the request against the webhook's authentication setting.
pub async fn verify_auth(
    auth: &WebhookAuth,
    headers: &HeaderMap,
    vault: &dyn CredentialVault,
) -> Result<(), TriggerError> {
    let credential_id = match auth {
        WebhookAuth::None => return Ok(()),
        WebhookAuth::Basic { credential_id } | WebhookAuth::Header { credential_id } => credential_id,
    };
    let creds = vault.get_decrypted(credential_id, None).await.map_err(|e| {
        tracing::warn!("⚠️ Webhook credential {} unavailable: {}", credential_id, e);
        TriggerError::Unauthorized
    })?;

    let authorized = match auth {
        WebhookAuth::None => true,
        WebhookAuth::Basic { .. } => {
            let expected_user = creds.get("user").or_else(|| creds.get("username"));
            let expected_password = creds.get("password");
            match (basic_credentials(headers), expected_user, expected_password) {
                (Some((user, password)), Some(eu), Some(ep)) => {
                    secret_eq(user.as_bytes(), eu.as_bytes()) & secret_eq(password.as_bytes(), ep.as_bytes())
                }
                _ => false,
            }
        }
        WebhookAuth::Header { .. } => match (creds.get("name"), creds.get("value")) {
            (Some(name), Some(value)) => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|received| secret_eq(received.as_bytes(), value.as_bytes())),
            _ => false,
        },
    };

    if authorized {
        Ok(())
    } else {
        Err(TriggerError::Unauthorized)
    }
}

/// Compares secrets without stopping at the first differing byte.
fn secret_eq(received: &[u8], expected: &[u8]) -> bool {
    let diff = received
        .iter()
        .zip(expected)
        .fold(received.len() ^ expected.len(), |acc, (a, b)| acc | usize::from(a ^ b));
    diff == 0
}

/// Decodes `Authorization: Basic base64(user:password)`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ").or_else(|| raw.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Execution input built from an inbound request.
pub fn build_input(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    query: HashMap<String, String>,
    body: Value,
) -> Item {
    let headers: Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| *name != header::AUTHORIZATION)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();
    json!({
        "method": method.to_uppercase(),
        "path": normalize_path(path),
        "headers": headers,
        "query": query,
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::StaticCredentialVault;
    use crate::trigger::types::ResponseMode;
    use axum::http::HeaderValue;

    #[test]
    fn test_secret_eq() {
        assert!(secret_eq(b"s3cret", b"s3cret"));
        assert!(secret_eq(b"", b""));
        assert!(!secret_eq(b"s3cret", b"s3creT"));
        assert!(!secret_eq(b"s3cret", b"s3cret!"));
        assert!(!secret_eq(b"", b"x"));
        assert!(!secret_eq(b"Xbcdef", b"abcdef"));
    }

    fn route(trigger_id: &str, method: &str, path: &str) -> WebhookRoute {
        WebhookRoute {
            trigger_id: trigger_id.into(),
            workflow_id: "wf".into(),
            node_id: "hook".into(),
            config: WebhookConfig {
                method: method.into(),
                path: normalize_path(path),
                response_mode: ResponseMode::OnReceived,
                auth: WebhookAuth::None,
            },
        }
    }

    #[test]
    fn test_route_conflicts_and_lookup() {
        let routes = WebhookRoutes::new();
        routes.register(route("t1", "POST", "/orders")).unwrap();
        assert!(routes.register(route("t2", "POST", "orders/")).is_err());
        routes.register(route("t2", "GET", "/orders")).unwrap();

        assert!(matches!(routes.lookup("post", "/orders/"), RouteMatch::Found(r) if r.trigger_id == "t1"));
        assert!(matches!(routes.lookup("DELETE", "/orders"), RouteMatch::MethodNotAllowed));
        assert!(matches!(routes.lookup("POST", "/other"), RouteMatch::NotFound));

        // Re-registering moves the trigger's route instead of duplicating it
        routes.register(route("t1", "POST", "/orders/v2")).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.unregister("t1"));
        assert!(!routes.unregister("t1"));
        assert_eq!(routes.len(), 1);
    }

    #[tokio::test]
    async fn test_basic_and_header_auth() {
        let vault = StaticCredentialVault::new()
            .with("basic", &[("user", "ada"), ("password", "pw")])
            .with("header", &[("name", "x-api-key"), ("value", "k1")]);
        let basic = WebhookAuth::Basic {
            credential_id: "basic".into(),
        };
        let by_header = WebhookAuth::Header {
            credential_id: "header".into(),
        };

        let mut headers = HeaderMap::new();
        let token = base64::engine::general_purpose::STANDARD.encode("ada:pw");
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {token}")).unwrap());
        assert!(verify_auth(&basic, &headers, &vault).await.is_ok());
        assert_eq!(
            verify_auth(&by_header, &headers, &vault).await,
            Err(TriggerError::Unauthorized)
        );

        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert!(verify_auth(&by_header, &headers, &vault).await.is_ok());
        headers.insert("x-api-key", HeaderValue::from_static("nope"));
        assert!(verify_auth(&by_header, &headers, &vault).await.is_err());

        assert!(verify_auth(&WebhookAuth::None, &HeaderMap::new(), &vault).await.is_ok());
    }

    #[test]
    fn test_build_input_drops_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert("x-request-id", HeaderValue::from_static("r1"));
        let query = HashMap::from([("page".to_string(), "2".to_string())]);
        let item = build_input("post", "orders", &headers, query, json!({"id": 7}));
        assert_eq!(item["method"], json!("POST"));
        assert_eq!(item["path"], json!("/orders"));
        assert_eq!(item["headers"], json!({"x-request-id": "r1"}));
        assert_eq!(item["query"]["page"], json!("2"));
        assert_eq!(item["body"]["id"], json!(7));
    }
}
