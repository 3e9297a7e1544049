//! Transport connections to backends.
//!
//! A [`Connection`] hides whether a backend is a child process speaking
//! JSON-RPC over its stdio pipes ([`stdio::StdioConnection`]) or an HTTP
//! endpoint taking one POST per message ([`http::HttpConnection`]). Nothing
//! above this module branches on the transport kind.

pub mod framing;
pub mod http;
pub mod stdio;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{BackendSpec, TransportKind, TransportSpec};
use crate::mcp::types::JsonRpcResponse;
use crate::process::ProcessArena;

pub use http::HttpConnection;
pub use stdio::StdioConnection;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl TransportError {
    /// Errors after which the connection cannot carry further traffic.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Framing(_) | TransportError::Io(_)
        )
    }
}

/// A live, protocol-level link to one backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Completes the protocol handshake. A no-op for HTTP backends.
    async fn handshake(&self) -> Result<(), TransportError>;

    /// Sends one request and waits for its response. The response id is the
    /// transport's own correlation id; callers restore their client's id.
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Sends a notification; no response is expected.
    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<(), TransportError>;

    fn is_healthy(&self) -> bool;

    /// Recent stderr output, newest last. Empty for transports without one.
    fn stderr_tail(&self) -> Vec<String>;

    async fn close(&self);
}

/// Opens connections for backend specs. Lifecycle managers go through this
/// seam so tests can count or fake launches.
pub trait Connector: Send + Sync {
    fn connect(&self, spec: &BackendSpec) -> Result<Arc<dyn Connection>, TransportError>;
}

/// The production connector: spawns stdio processes into the shared arena
/// and builds HTTP connections on a shared client.
#[derive(Clone)]
pub struct TransportConnector {
    arena: ProcessArena,
    http_client: reqwest::Client,
}

impl TransportConnector {
    pub fn new(arena: ProcessArena) -> Self {
        Self {
            arena,
            http_client: http::build_client(),
        }
    }
}

impl Connector for TransportConnector {
    fn connect(&self, spec: &BackendSpec) -> Result<Arc<dyn Connection>, TransportError> {
        match &spec.transport {
            TransportSpec::Stdio(stdio) => {
                let conn = StdioConnection::spawn(&spec.id, stdio, self.arena.clone())?;
                Ok(Arc::new(conn))
            }
            TransportSpec::Http(http) => {
                let conn = HttpConnection::new(&spec.id, http, self.http_client.clone())?;
                Ok(Arc::new(conn))
            }
        }
    }
}
