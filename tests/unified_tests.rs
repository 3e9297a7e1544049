use axum::{body::Body, http::Request, http::StatusCode, Router};
use mcpgate::{
    build_router,
    config::Mode,
    test_utils::test_helpers::{mock_backend_spec, post_json, rpc, test_config, test_gateway},
    AppState, Gateway,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const MOCK: &str = env!("CARGO_BIN_EXE_mock-backend");

fn setup(api_key: Option<&str>) -> (Router, Arc<Gateway>) {
    let mut config = test_config(
        vec![
            mock_backend_spec(MOCK, "alpha", &[("MOCK_TOOLS", "echo,search_bare")]),
            mock_backend_spec(MOCK, "beta", &[("MOCK_TOOLS", "echo,lookup_noschema")]),
        ],
        Mode::Unified,
    );
    config.api_key = api_key.map(str::to_string);
    let gateway = test_gateway(config);
    (build_router(AppState::new(gateway.clone())), gateway)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn call(app: &Router, body: Value) -> Value {
    let response = app
        .clone()
        .oneshot(post_json("/mcp", &body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_initialize_issues_session() {
    let (app, gateway) = setup(None);

    let response = app
        .oneshot(post_json(
            "/mcp",
            &rpc(1, "initialize", json!({"protocolVersion": "2025-03-26"})),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap();
    assert_eq!(session.len(), 36);
    assert!(gateway.sessions().get(&session).is_some());

    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["serverInfo"]["name"], "mcpgate");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_tools_list_is_namespaced_and_sorted() {
    let (app, gateway) = setup(None);

    let body = call(&app, rpc(2, "tools/list", json!({}))).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec![
            "alpha___echo",
            "alpha___search_bare",
            "beta___echo",
            "beta___lookup_noschema",
            "sys___init",
            "sys___list_servers",
        ]
    );

    assert_eq!(tools[0]["description"], "[alpha] Mock tool echo");
    assert_eq!(tools[0]["annotations"]["readOnlyHint"], true);
    assert_eq!(
        tools[1]["inputSchema"],
        json!({"type": "object", "properties": {}})
    );
    assert_eq!(
        tools[3]["inputSchema"],
        json!({"type": "object", "properties": {}})
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_tools_call_reaches_owning_backend() {
    let (app, gateway) = setup(None);

    let body = call(
        &app,
        rpc(
            "req-7",
            "tools/call",
            json!({"name": "beta___echo", "arguments": {"text": "hello"}}),
        ),
    )
    .await;

    assert_eq!(body["id"], "req-7");
    assert_eq!(body["result"]["content"][0]["text"], "hello");
    // Only the backend that was called got launched.
    assert_eq!(gateway.backend("alpha").unwrap().launches(), 0);
    assert_eq!(gateway.backend("beta").unwrap().launches(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_is_invalid_params() {
    let (app, gateway) = setup(None);

    for name in ["nobody___echo", "no_separator", "alpha___"] {
        let body = call(&app, rpc(3, "tools/call", json!({"name": name}))).await;
        assert_eq!(body["error"]["code"], -32602, "{name}");
    }

    let body = call(&app, rpc(4, "tools/call", json!({"arguments": {}}))).await;
    assert_eq!(body["error"]["code"], -32602);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_sys_tools_answer_locally() {
    let (app, gateway) = setup(None);

    let body = call(&app, rpc(5, "tools/call", json!({"name": "sys___list_servers"}))).await;
    assert_eq!(
        body["result"]["content"][0]["text"],
        "Configured MCP Servers:\n1. alpha\n2. beta\n"
    );

    let body = call(&app, rpc(6, "tools/call", json!({"name": "sys___init"}))).await;
    assert_eq!(
        body["result"]["content"][0]["text"],
        "Gateway initialized. Available servers: [alpha beta]"
    );
    assert_eq!(gateway.arena().len(), 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_partial_failure_keeps_healthy_backends() {
    let config = test_config(
        vec![
            mock_backend_spec(MOCK, "good", &[("MOCK_TOOLS", "echo")]),
            mock_backend_spec(MOCK, "bad", &[("MOCK_FAIL_STARTUP", "no credentials")]),
        ],
        Mode::Unified,
    );
    let gateway = test_gateway(config);
    let app = build_router(AppState::new(gateway.clone()));

    let body = call(&app, rpc(1, "tools/list", json!({}))).await;
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["good___echo", "sys___init", "sys___list_servers"]);

    let body = call(&app, rpc(2, "tools/call", json!({"name": "bad___echo"}))).await;
    assert_eq!(body["error"]["code"], -32002);
    assert_eq!(body["error"]["data"]["backend"], "bad");

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["servers"]["good"]["status"], "running");
    assert_eq!(health["servers"]["good"]["tools"], 1);
    assert_eq!(health["servers"]["bad"]["status"], "error");
    assert!(health["servers"]["bad"]["lastError"]
        .as_str()
        .unwrap()
        .contains("no credentials"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_notifications_are_accepted() {
    let (app, gateway) = setup(None);

    let response = app
        .oneshot(post_json(
            "/mcp",
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unhandled_method_goes_to_default_backend() {
    let (app, gateway) = setup(None);

    let body = call(&app, rpc(9, "resources/list", json!({}))).await;
    assert_eq!(body["id"], 9);
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(gateway.backend("alpha").unwrap().launches(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_malformed_bodies() {
    let (app, gateway) = setup(None);

    let response = app
        .clone()
        .oneshot(
            Request::post("/mcp")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);

    let body = call(&app, json!([rpc(1, "ping", json!({}))])).await;
    assert_eq!(body["error"]["code"], -32600);

    let body = call(&app, json!({"jsonrpc": "1.0", "id": 2, "method": "ping"})).await;
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_api_key_is_enforced() {
    let (app, gateway) = setup(Some("s3cret"));
    let ping = rpc(1, "ping", json!({}));

    let response = app
        .clone()
        .oneshot(post_json("/mcp", &ping, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "missing_token");

    let response = app
        .clone()
        .oneshot(post_json("/mcp", &ping, Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post_json("/mcp?token=s3cret", &ping, Some("s3cret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    for auth in ["s3cret", "Bearer s3cret", "bearer s3cret"] {
        let response = app
            .clone()
            .oneshot(post_json("/mcp", &ping, Some(auth)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{auth}");
    }

    // Health stays open.
    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json("/close", &json!({}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_close_then_gone() {
    let (app, gateway) = setup(None);
    gateway.start_all().await;
    assert_eq!(gateway.arena().len(), 2);

    let response = app
        .clone()
        .oneshot(post_json("/close", &json!({}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "closed");
    assert_eq!(body["serversTerminated"], 2);
    assert!(gateway.arena().is_empty());
    assert!(gateway.shutdown_token().is_cancelled());

    let response = app
        .clone()
        .oneshot(post_json("/close", &json!({}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}
