use mcpgate::{
    config::{Mode, StdioSpec},
    process::ProcessArena,
    test_utils::test_helpers::{mock_backend_spec, test_config, test_gateway},
    transport::{Connection, StdioConnection},
};
use serde_json::json;

const MOCK: &str = env!("CARGO_BIN_EXE_mock-backend");

async fn connect(env: &[(&str, &str)]) -> (StdioConnection, ProcessArena) {
    let spec = env
        .iter()
        .fold(StdioSpec::command(MOCK, Vec::new()), |spec, (k, v)| {
            spec.with_env(*k, *v)
        });
    let arena = ProcessArena::new();
    let conn = StdioConnection::spawn("mock", &spec, arena.clone()).unwrap();
    conn.handshake().await.unwrap();
    (conn, arena)
}

#[tokio::test]
async fn test_handshake_and_call() {
    let (conn, arena) = connect(&[]).await;
    assert_eq!(
        conn.server_info().unwrap()["serverInfo"]["name"],
        "mock-backend"
    );
    assert!(conn.is_healthy());
    assert_eq!(arena.count_for("mock"), 1);

    let response = conn
        .send(
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "ping"}})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.result.unwrap()["content"][0]["text"], "ping");

    conn.close().await;
    assert!(arena.is_empty());
    assert!(!conn.is_healthy());
}

#[tokio::test]
async fn test_log_lines_on_stdout_are_skipped() {
    let (conn, _arena) = connect(&[("MOCK_NOISE", "1")]).await;

    let response = conn.send("tools/list", None, None).await.unwrap();
    assert_eq!(response.result.unwrap()["tools"][0]["name"], "echo");

    conn.close().await;
}

#[tokio::test]
async fn test_split_and_pretty_frames_are_reassembled() {
    let (conn, _arena) = connect(&[("MOCK_SPLIT", "1"), ("MOCK_PRETTY", "1")]).await;

    for i in 0..3 {
        let text = format!("message {i}");
        let response = conn
            .send(
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"text": text}})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["content"][0]["text"], text);
    }

    conn.close().await;
}

#[tokio::test]
async fn test_initialize_after_handshake_is_cached() {
    let (conn, _arena) = connect(&[]).await;

    let first = conn.send("initialize", Some(json!({})), None).await.unwrap();
    let second = conn.send("initialize", Some(json!({})), None).await.unwrap();
    assert_eq!(first.result, second.result);
    assert_eq!(first.result.unwrap()["protocolVersion"], "2024-11-05");

    conn.close().await;
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let (conn, _arena) = connect(&[]).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(conn
        .stderr_tail()
        .iter()
        .any(|line| line.contains("mock-backend: ready")));
    conn.close().await;
}

#[tokio::test]
async fn test_paginated_discovery_collects_every_page() {
    let config = test_config(
        vec![mock_backend_spec(
            MOCK,
            "paged",
            &[("MOCK_TOOLS", "a,b,c,d,e"), ("MOCK_PAGE_SIZE", "2")],
        )],
        Mode::Unified,
    );
    let gateway = test_gateway(config);

    let backend = gateway.ensure_ready("paged").await.unwrap();
    let (_, tools) = backend.tool_catalog();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(gateway.registry().list_for_backend("paged").await.len(), 5);

    gateway.shutdown().await;
}
