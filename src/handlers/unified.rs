//! Unified surface: `POST /mcp`.
//!
//! The gateway answers the session-level methods itself, serves the
//! namespaced catalog, dispatches `tools/call` through the registry and hands
//! anything else to the default backend.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
    Extension,
};
use serde_json::json;
use uuid::Uuid;

use super::rpc::{
    accepted, error_response, initialize_result, outcome_response, parse_request, rpc_response,
};
use crate::mcp::types::{error_codes, CallToolParams, JsonRpcError, JsonRpcResponse};
use crate::session::{session_id_from_headers, Caller};
use crate::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let gateway = &state.gateway;

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let mut session_id = session_id_from_headers(&headers);
    if session_id.is_none() && request.method == "initialize" {
        session_id = Some(Uuid::new_v4().to_string());
    }
    if let Some(session) = &session_id {
        gateway.sessions().touch(session, &caller);
    }
    let echo = session_id.clone();
    let echo = echo.as_deref();

    tracing::debug!(method = %request.method, "unified request");

    let Some(id) = request.id.clone() else {
        return accepted(echo);
    };

    match request.method.as_str() {
        "initialize" => rpc_response(
            JsonRpcResponse::success(id, initialize_result(request.params.as_ref())),
            echo,
        ),
        "ping" => rpc_response(JsonRpcResponse::success(id, json!({})), echo),
        "tools/list" => {
            let tools = gateway.list_tools().await;
            rpc_response(JsonRpcResponse::success(id, json!({ "tools": tools })), echo)
        }
        "tools/call" => {
            let call = match request
                .params
                .map(serde_json::from_value::<CallToolParams>)
            {
                Some(Ok(call)) => call,
                Some(Err(e)) => {
                    return error_response(
                        id,
                        JsonRpcError::new(
                            error_codes::INVALID_PARAMS,
                            format!("invalid tools/call params: {e}"),
                        ),
                        echo,
                    )
                }
                None => {
                    return error_response(
                        id,
                        JsonRpcError::new(
                            error_codes::INVALID_PARAMS,
                            "tools/call requires a tool name",
                        ),
                        echo,
                    )
                }
            };

            let arguments = call.arguments.unwrap_or_else(|| json!({}));
            let outcome = gateway
                .dispatch_tool(&call.name, arguments, session_id.clone())
                .await;
            outcome_response(id, outcome, echo)
        }
        method => match gateway.default_backend_id() {
            Some(backend_id) => {
                let outcome = gateway
                    .forward(&backend_id, method, request.params, session_id.clone())
                    .await;
                outcome_response(id, outcome, echo)
            }
            None => error_response(
                id,
                JsonRpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                ),
                echo,
            ),
        },
    }
}

