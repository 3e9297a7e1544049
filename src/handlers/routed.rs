//! Routed surface: `POST /mcp/{backend_id}`.
//!
//! Requests go to one backend with tool names untouched. The only rewriting
//! is the backend's tool allow-list, applied to `tools/list` results and
//! `tools/call` names.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde_json::{json, Value};

use super::rpc::{
    accepted, error_response, initialize_result, outcome_response, parse_request, rpc_response,
};
use crate::config::BackendSpec;
use crate::mcp::sys::{self, SYS_BACKEND_ID};
use crate::mcp::types::{error_codes, CallToolParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::session::{session_id_from_headers, Caller};
use crate::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let gateway = &state.gateway;
    let is_sys = backend_id == SYS_BACKEND_ID;

    let spec = match gateway.backend(&backend_id) {
        Ok(backend) => Some(backend.spec().clone()),
        Err(_) if is_sys => None,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("Unknown MCP server '{backend_id}'")})),
            )
                .into_response()
        }
    };

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let session_id = session_id_from_headers(&headers);
    if let Some(session) = &session_id {
        gateway.sessions().touch(session, &caller);
    }

    tracing::debug!(backend = %backend_id, method = %request.method, "routed request");

    match spec {
        None => handle_sys(&state, request, session_id.as_deref()),
        Some(spec) => handle_backend(&state, &spec, request, session_id).await,
    }
}

async fn handle_backend(
    state: &AppState,
    spec: &BackendSpec,
    request: JsonRpcRequest,
    session_id: Option<String>,
) -> Response {
    let gateway = &state.gateway;
    let echo = session_id.clone();

    let Some(id) = request.id.clone() else {
        if let Err(e) = gateway
            .notify(&spec.id, &request.method, request.params, session_id)
            .await
        {
            tracing::warn!(backend = %spec.id, method = %request.method, error = %e, "notification not delivered");
        }
        return accepted(echo.as_deref());
    };

    if request.method == "tools/call" && spec.tools.is_some() {
        let name = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !spec.allows_tool(name) {
            return error_response(
                id,
                JsonRpcError::new(
                    error_codes::INVALID_PARAMS,
                    format!("tool '{name}' is not exposed by server '{}'", spec.id),
                ),
                echo.as_deref(),
            );
        }
    }

    let outcome = gateway
        .forward(&spec.id, &request.method, request.params, session_id)
        .await
        .map(|response| match request.method.as_str() {
            "tools/list" if spec.tools.is_some() => filter_tool_list(spec, response),
            _ => response,
        });

    outcome_response(id, outcome, echo.as_deref())
}

/// Drops tools outside the backend's allow-list from a `tools/list` result.
fn filter_tool_list(spec: &BackendSpec, mut response: JsonRpcResponse) -> JsonRpcResponse {
    if let Some(tools) = response
        .result
        .as_mut()
        .and_then(|r| r.get_mut("tools"))
        .and_then(Value::as_array_mut)
    {
        tools.retain(|tool| {
            tool.get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| spec.allows_tool(name))
        });
    }
    response
}

/// `/mcp/sys`: the introspection tools under their bare names.
fn handle_sys(state: &AppState, request: JsonRpcRequest, session_id: Option<&str>) -> Response {
    let Some(id) = request.id.clone() else {
        return accepted(session_id);
    };

    let result = match request.method.as_str() {
        "initialize" => Ok(initialize_result(request.params.as_ref())),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": sys::tools() })),
        "tools/call" => match request
            .params
            .and_then(|p| serde_json::from_value::<CallToolParams>(p).ok())
        {
            Some(call) => sys::call(&call.name, &state.gateway.backend_ids()).map_err(Into::into),
            None => Err(JsonRpcError::new(
                error_codes::INVALID_PARAMS,
                "tools/call requires a tool name",
            )),
        },
        other => Err(JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    };

    match result {
        Ok(result) => rpc_response(JsonRpcResponse::success(id, result), session_id),
        Err(error) => error_response(id, error, session_id),
    }
}
