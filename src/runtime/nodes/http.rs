//! HttpRequest node: one outbound request per item
//!
//! Supports GET, POST, PUT, PATCH, DELETE and HEAD. POST, PUT and PATCH send the
//! item itself as JSON unless `body` is given or `sendBody` is false.
//! Credentials come from the vault via `credentialId`.
//!
//! Responses with status >= 400 become error items
//! (`{..item, "error": {"statusCode", "message", "body"}}`) unless `throwOnError`
//! is set, in which case the node fails and the error policy takes over.

use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::runtime::context::ExecutionContext;
use crate::runtime::flow::to_text;
use crate::services::CredentialVault;
use crate::workflow::{Item, Node, PortItems};

use super::{flatten_inputs, Expressions};

/// Shared client state for HTTP nodes
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialVault>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyType {
    Json,
    Form,
    Text,
}

/// Outcome of a single request
enum Outcome {
    Response { status: u16, headers: Map<String, Value>, body: Value },
    Failed { status: Option<u16>, message: String, body: Value },
}

impl HttpClient {
    pub fn new(client: reqwest::Client, credentials: Arc<dyn CredentialVault>) -> Self {
        Self { client, credentials }
    }

    pub async fn run(
        &self,
        exprs: &Expressions<'_>,
        node: &Node,
        inputs: PortItems,
        context: &ExecutionContext,
    ) -> Result<PortItems> {
        let throw_on_error = node.param_bool("throwOnError", false);
        let full_response = node.param_str("outputMode") == Some("response");

        let mut output = Vec::new();
        for (index, item) in flatten_inputs(inputs).into_iter().enumerate() {
            match self.send(exprs, node, &item, index, context).await? {
                Outcome::Response { status, headers, body } => {
                    if full_response {
                        output.push(json!({ "statusCode": status, "headers": headers, "body": body }));
                    } else {
                        output.push(merge_response(item, body));
                    }
                }
                Outcome::Failed { status, message, body } => {
                    if throw_on_error {
                        return Err(EngineError::node(&node.id, message));
                    }
                    tracing::warn!(node_id = %node.id, ?status, "⚠️ HTTP request failed: {message}");
                    let mut failed = super::as_item(item);
                    if let Value::Object(map) = &mut failed {
                        map.insert(
                            "error".into(),
                            json!({ "statusCode": status, "message": message, "body": body }),
                        );
                    }
                    output.push(failed);
                }
            }
        }
        Ok(vec![output])
    }

    async fn send(
        &self,
        exprs: &Expressions<'_>,
        node: &Node,
        item: &Item,
        index: usize,
        context: &ExecutionContext,
    ) -> Result<Outcome> {
        // STEP 1: Resolve parameters against the item
        let resolve = |key: &'static str| async move {
            match node.param(key) {
                Some(raw) => exprs.resolve(raw, item, index).await.map(Some),
                None => Ok(None),
            }
        };

        let url = match resolve("url").await? {
            Some(Value::String(url)) if !url.is_empty() => url,
            _ => return Err(EngineError::node(&node.id, "HttpRequest missing 'url' parameter")),
        };
        let method_name = match resolve("method").await? {
            Some(Value::String(m)) => m.to_uppercase(),
            _ => "GET".to_string(),
        };
        let method = match method_name.as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            other => return Err(EngineError::node(&node.id, format!("Unsupported HTTP method: {other}"))),
        };

        let mut request = self.client.request(method.clone(), &url);

        if let Some(Value::Object(headers)) = resolve("headers").await? {
            for (name, value) in &headers {
                request = request.header(name.as_str(), to_text(value));
            }
        }
        if let Some(Value::Object(query)) = resolve("query").await? {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), to_text(v)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(ms) = node.param_u64("timeoutMs") {
            request = request.timeout(Duration::from_millis(ms));
        }

        // STEP 2: Body
        let body = match resolve("body").await? {
            Some(body) => Some(body),
            None if node.param_bool("sendBody", true)
                && matches!(method, Method::POST | Method::PUT | Method::PATCH) =>
            {
                Some(item.clone())
            }
            None => None,
        };
        if let Some(body) = body {
            let body_type = match node.param_str("bodyContentType").unwrap_or("json") {
                "form" | "form-urlencoded" => BodyType::Form,
                "text" | "raw" => BodyType::Text,
                _ => BodyType::Json,
            };
            request = match body_type {
                BodyType::Json => request.json(&body),
                BodyType::Form => {
                    let fields: HashMap<String, String> = body
                        .as_object()
                        .map(|map| map.iter().map(|(k, v)| (k.clone(), to_text(v))).collect())
                        .unwrap_or_default();
                    request.form(&fields)
                }
                BodyType::Text => request
                    .header("Content-Type", "text/plain")
                    .body(to_text(&body)),
            };
        }

        // STEP 3: Authentication
        request = self.authenticate(node, request, context).await?;

        tracing::debug!(node_id = %node.id, "🌍 HTTP Request: {} {}", method, url);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(Outcome::Failed {
                    status: None,
                    message: format!("HTTP request failed: {e}"),
                    body: Value::Null,
                })
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), Value::String(s.to_string()))))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::node(&node.id, format!("Failed to read response body: {e}")))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::info!(node_id = %node.id, "✅ HTTP request completed: {} {} (status: {})", method, url, status);

        if status.as_u16() >= 400 {
            return Ok(Outcome::Failed {
                status: Some(status.as_u16()),
                message: format!("Request failed with status {}", status.as_u16()),
                body,
            });
        }
        Ok(Outcome::Response {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    async fn authenticate(
        &self,
        node: &Node,
        request: reqwest::RequestBuilder,
        context: &ExecutionContext,
    ) -> Result<reqwest::RequestBuilder> {
        let scheme = node.param_str("authentication").unwrap_or("none");
        if scheme == "none" {
            return Ok(request);
        }
        let credential_id = node
            .param_str("credentialId")
            .ok_or_else(|| EngineError::node(&node.id, format!("Authentication '{scheme}' needs a 'credentialId'")))?;
        let creds = self
            .credentials
            .get_decrypted(credential_id, context.user_id.as_deref())
            .await
            .map_err(|e| EngineError::node(&node.id, e))?;
        let field = |names: &[&str]| names.iter().find_map(|n| creds.get(*n).cloned());

        match scheme {
            "basicAuth" => {
                let user = field(&["user", "username"]).unwrap_or_default();
                Ok(request.basic_auth(user, field(&["password"])))
            }
            "headerAuth" => {
                let name = field(&["name"])
                    .ok_or_else(|| EngineError::node(&node.id, "Header credential has no 'name'"))?;
                Ok(request.header(name.as_str(), field(&["value"]).unwrap_or_default()))
            }
            "bearerToken" => {
                let token = field(&["token"])
                    .ok_or_else(|| EngineError::node(&node.id, "Bearer credential has no 'token'"))?;
                Ok(request.bearer_auth(token))
            }
            other => Err(EngineError::node(&node.id, format!("Unknown authentication '{other}'"))),
        }
    }
}

/// Response object fields are merged into the item, anything else lands under `data`.
fn merge_response(item: Item, body: Value) -> Item {
    let mut merged = super::as_item(item);
    if let Value::Object(map) = &mut merged {
        match body {
            Value::Object(fields) => map.extend(fields),
            Value::Null => {}
            other => {
                map.insert("data".into(), other);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_response() {
        assert_eq!(
            merge_response(json!({"id": 1}), json!({"ok": true})),
            json!({"id": 1, "ok": true})
        );
        assert_eq!(
            merge_response(json!({"id": 1}), json!([1, 2])),
            json!({"id": 1, "data": [1, 2]})
        );
        assert_eq!(merge_response(json!({"id": 1}), Value::Null), json!({"id": 1}));
    }
}
