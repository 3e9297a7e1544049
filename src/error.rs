use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::mcp::types::{error_codes, JsonRpcError};
use crate::transport::TransportError;

// Type alias for Result with our GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error types for gateway dispatch and backend lifecycle operations
///
/// Every variant surfaces to MCP clients as a JSON-RPC error object inside
/// an HTTP 200 response; none of them is fatal to the gateway process.
///
/// # Error Conversion
///
/// `From<GatewayError> for JsonRpcError` assigns the JSON-RPC code.
///
/// # Usage
///
/// ```rust,no_run
/// use mcpgate::error::GatewayError;
///
/// fn pick_backend(id: &str, known: &[&str]) -> Result<(), GatewayError> {
///     if !known.contains(&id) {
///         return Err(GatewayError::BackendNotFound(id.to_string()));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No backend with this id is configured
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// The tool name is not in the catalog and does not decompose to a
    /// configured backend
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Launch or handshake failed, or did not finish within the startup
    /// timeout. Carries the recorded diagnostics.
    #[error("backend '{backend}' failed to start: {reason}")]
    Startup { backend: String, reason: String },

    /// Backend exhausted its restarts or has been stopped
    #[error("backend '{backend}' is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// The connection failed while carrying a call
    #[error("backend '{backend}' transport error: {source}")]
    Transport {
        backend: String,
        #[source]
        source: TransportError,
    },

    /// A call exceeded the tool timeout. The backend keeps running.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Convert GatewayError to a JSON-RPC error object
///
/// | GatewayError Variant | JSON-RPC Code         |
/// |----------------------|-----------------------|
/// | BackendNotFound      | METHOD_NOT_FOUND      |
/// | ToolNotFound         | INVALID_PARAMS        |
/// | Startup              | BACKEND_UNAVAILABLE   |
/// | Unavailable          | BACKEND_UNAVAILABLE   |
/// | ShuttingDown         | BACKEND_UNAVAILABLE   |
/// | Transport            | INTERNAL_ERROR        |
/// | Timeout              | REQUEST_TIMEOUT       |
impl From<GatewayError> for JsonRpcError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::BackendNotFound(backend) => {
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, message)
                    .with_data(json!({"backend": backend}))
            }
            GatewayError::ToolNotFound(tool) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, message)
                    .with_data(json!({"tool": tool}))
            }
            GatewayError::Startup { backend, .. } | GatewayError::Unavailable { backend, .. } => {
                JsonRpcError::new(error_codes::BACKEND_UNAVAILABLE, message)
                    .with_data(json!({"backend": backend}))
            }
            GatewayError::Transport { backend, .. } => {
                JsonRpcError::new(error_codes::INTERNAL_ERROR, message)
                    .with_data(json!({"backend": backend}))
            }
            GatewayError::Timeout { timeout_ms, .. } => {
                JsonRpcError::new(error_codes::REQUEST_TIMEOUT, message)
                    .with_data(json!({"timeoutMs": timeout_ms}))
            }
            GatewayError::ShuttingDown => {
                JsonRpcError::new(error_codes::BACKEND_UNAVAILABLE, message)
            }
        }
    }
}

/// Authentication failures at the HTTP boundary
///
/// Messages never echo the presented credential.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization header is required")]
    MissingAuthorizationHeader,

    #[error("Authorization header is malformed")]
    MalformedAuthorizationHeader,

    #[error("Credentials must not be passed in the query string")]
    CredentialInQueryString,

    #[error("Invalid API key")]
    InvalidApiKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = match self {
            AuthError::MissingAuthorizationHeader => (StatusCode::UNAUTHORIZED, "missing_token"),
            AuthError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "invalid_token"),
            AuthError::MalformedAuthorizationHeader | AuthError::CredentialInQueryString => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
        };

        let body = json!({
            "error": error_code,
            "error_description": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
