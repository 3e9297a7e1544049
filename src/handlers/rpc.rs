//! JSON-RPC envelope handling shared by the routed and unified surfaces.
//!
//! MCP errors travel inside the JSON-RPC body, so every outcome here is an
//! HTTP 200 except notifications, which get an empty 202.

use axum::{
    body::Bytes,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::mcp::types::{
    error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::session::SESSION_HEADER;

/// Parses a request body into a single JSON-RPC request.
///
/// On failure the ready-to-send error response is returned instead:
/// `-32700` for unparseable JSON, `-32600` for anything that is JSON but
/// not a valid request envelope.
#[allow(clippy::result_large_err)]
pub fn parse_request(body: &Bytes) -> Result<JsonRpcRequest, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "request body is not JSON");
        error_response(
            Value::Null,
            JsonRpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {e}")),
            None,
        )
    })?;

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let invalid = |message: &str| {
        error_response(
            id.clone(),
            JsonRpcError::new(error_codes::INVALID_REQUEST, format!("Invalid Request: {message}")),
            None,
        )
    };

    if value.is_array() {
        return Err(invalid("batch requests are not supported"));
    }
    if !value.is_object() {
        return Err(invalid("expected a JSON object"));
    }
    if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid("jsonrpc must be \"2.0\""));
    }
    if !value.get("method").is_some_and(Value::is_string) {
        return Err(invalid("method must be a string"));
    }
    if value
        .get("id")
        .is_some_and(|id| !(id.is_string() || id.is_number() || id.is_null()))
    {
        return Err(invalid("id must be a string or a number"));
    }

    serde_json::from_value(value).map_err(|e| invalid(&e.to_string()))
}

/// Serializes a response, echoing the session id when there is one.
pub fn rpc_response(response: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let mut http = Json(response).into_response();
    if let Some(session) = session_id.and_then(|s| HeaderValue::from_str(s).ok()) {
        http.headers_mut().insert(SESSION_HEADER, session);
    }
    http
}

pub fn error_response(id: Value, error: JsonRpcError, session_id: Option<&str>) -> Response {
    rpc_response(JsonRpcResponse::failure(id, error), session_id)
}

/// Converts a gateway outcome into the response for request `id`; backend
/// responses get the client's id back.
pub fn outcome_response(
    id: Value,
    outcome: Result<JsonRpcResponse, GatewayError>,
    session_id: Option<&str>,
) -> Response {
    match outcome {
        Ok(response) => rpc_response(response.with_id(id), session_id),
        Err(err) => {
            tracing::debug!(error = %err, "request failed");
            error_response(id, err.into(), session_id)
        }
    }
}

/// 202 with no body, the answer to every notification.
pub fn accepted(session_id: Option<&str>) -> Response {
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Some(session) = session_id.and_then(|s| HeaderValue::from_str(s).ok()) {
        response.headers_mut().insert(SESSION_HEADER, session);
    }
    response
}

/// The gateway's own `initialize` result.
pub fn initialize_result(params: Option<&Value>) -> Value {
    let version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "mcpgate", "version": env!("CARGO_PKG_VERSION")}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<JsonRpcRequest, Response> {
        parse_request(&Bytes::from(body.to_string()))
    }

    #[test]
    fn parses_request_and_notification() {
        let request = parse(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert_eq!(request.id, Some(json!(7)));
        let note = parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(note.is_notification());
    }

    #[test]
    fn rejects_bad_envelopes() {
        assert!(parse("{not json").is_err());
        assert!(parse(r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#).is_err());
        assert!(parse(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).is_err());
        assert!(parse(r#"{"jsonrpc":"2.0","id":1,"method":5}"#).is_err());
        assert!(parse(r#"{"jsonrpc":"2.0","id":{},"method":"ping"}"#).is_err());
    }

    #[test]
    fn initialize_echoes_requested_version() {
        let result = initialize_result(Some(&json!({"protocolVersion": "2025-03-26"})));
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(initialize_result(None)["protocolVersion"], PROTOCOL_VERSION);
    }
}
