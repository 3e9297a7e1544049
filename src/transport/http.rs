//! JSON-RPC over HTTP POST for already-running MCP endpoints.
//!
//! Every call is an independent POST, so calls to one HTTP backend run in
//! parallel. Stateful backends are kept on one conversation through the
//! `Mcp-Session-Id` header: the caller's session wins, otherwise the id the
//! backend handed out last is reused.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcpgate::config::HttpSpec;
//! use mcpgate::transport::{http, Connection, HttpConnection};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = HttpSpec::new("http://localhost:8080/mcp").with_header("X-Team", "infra");
//! let conn = HttpConnection::new("docs", &spec, http::build_client())?;
//! let tools = conn.send("tools/list", None, None).await?;
//! println!("{:?}", tools.result);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use super::{Connection, TransportError};
use crate::config::{HttpSpec, TransportKind};
use crate::mcp::types::{JsonRpcRequest, JsonRpcResponse};
use crate::sanitize::{sanitize, truncate_text};

pub const SESSION_HEADER: &str = "mcp-session-id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 512;

/// Shared client for all HTTP backends. Per-call deadlines are enforced by
/// the caller, so only connection setup is bounded here.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub struct HttpConnection {
    backend_id: String,
    url: reqwest::Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session: RwLock<Option<String>>,
    next_id: AtomicU64,
    healthy: AtomicBool,
}

impl HttpConnection {
    /// Validates the URL and configured headers. No request is made.
    pub fn new(
        backend_id: &str,
        spec: &HttpSpec,
        client: reqwest::Client,
    ) -> Result<Self, TransportError> {
        let url = reqwest::Url::parse(&spec.url).map_err(|e| TransportError::InvalidUrl {
            url: spec.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl {
                url: spec.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::InvalidUrl {
                    url: spec.url.clone(),
                    reason: format!("invalid header name '{name}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| TransportError::InvalidUrl {
                url: spec.url.clone(),
                reason: format!("invalid value for header '{name}'"),
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            backend_id: backend_id.to_string(),
            url,
            headers,
            client,
            session: RwLock::new(None),
            next_id: AtomicU64::new(1),
            healthy: AtomicBool::new(true),
        })
    }

    /// The session id most recently issued by the backend.
    pub fn backend_session(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(
        &self,
        message: &JsonRpcRequest,
        session_id: Option<String>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);

        if let Some(session) = session_id.or_else(|| self.backend_session()) {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.inspect_err(|_| {
            self.healthy.store(false, Ordering::SeqCst);
        })?;

        if let Some(issued) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if session.as_deref() != Some(issued) {
                tracing::debug!(backend = %self.backend_id, "backend issued a session id");
                *session = Some(issued.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            self.healthy.store(false, Ordering::SeqCst);
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: truncate_text(&sanitize(&body), ERROR_BODY_LIMIT),
            });
        }

        self.healthy.store(true, Ordering::SeqCst);
        Ok(response)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        // A configured, well-formed URL is enough to be considered ready.
        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcRequest::new(id, method, params);

        tracing::debug!(backend = %self.backend_id, method = %method, id, "POST to http backend");
        let response = self.post(&message, session_id).await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response.text().await?;
        if is_event_stream {
            return parse_event_stream(&body);
        }

        serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
            TransportError::InvalidResponse(format!(
                "{e}: {}",
                truncate_text(&sanitize(&body), ERROR_BODY_LIMIT)
            ))
        })
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<(), TransportError> {
        let message = JsonRpcRequest::notification(method, params);
        self.post(&message, session_id).await?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn stderr_tail(&self) -> Vec<String> {
        Vec::new()
    }

    async fn close(&self) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Extracts the first JSON-RPC response carried by an SSE body.
///
/// Events are separated by blank lines; multi-line `data:` fields are
/// joined with newlines as the SSE format prescribes.
pub fn parse_event_stream(body: &str) -> Result<JsonRpcResponse, TransportError> {
    let normalized = body.replace("\r\n", "\n");
    for event in normalized.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if data.is_empty() {
            continue;
        }

        let payload = data.join("\n");
        if let Ok(value) = serde_json::from_str::<Value>(&payload) {
            let is_response = value.get("method").is_none()
                && (value.get("result").is_some() || value.get("error").is_some());
            if is_response {
                return serde_json::from_value(value).map_err(TransportError::from);
            }
        }
    }

    Err(TransportError::InvalidResponse(
        "event stream ended without a JSON-RPC response".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_http_urls() {
        let spec = HttpSpec::new("ftp://example.com/mcp");
        let err = HttpConnection::new("x", &spec, build_client()).err().unwrap();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_invalid_header_values() {
        let spec = HttpSpec::new("http://example.com/mcp").with_header("X-Bad", "line\nbreak");
        assert!(HttpConnection::new("x", &spec, build_client()).is_err());
    }

    #[test]
    fn event_stream_skips_notifications() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{\"ok\":true}}\n\n";
        let response = parse_event_stream(body).unwrap();
        assert_eq!(response.id, json!(4));
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[test]
    fn event_stream_joins_multiline_data() {
        let body = "data: {\"jsonrpc\":\"2.0\",\r\ndata: \"id\":1,\"result\":{}}\r\n\r\n";
        let response = parse_event_stream(body).unwrap();
        assert_eq!(response.id, json!(1));
    }

    #[test]
    fn event_stream_without_response_is_invalid() {
        let err = parse_event_stream(": keep-alive\n\n").unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponse(_)));
    }
}
