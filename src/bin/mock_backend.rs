//! A minimal MCP server over stdio, used by the integration tests as a
//! stand-in for containerized backends.
//!
//! Behaviour is driven by environment variables:
//!
//! | Variable                | Effect                                                  |
//! |-------------------------|---------------------------------------------------------|
//! | `MOCK_TOOLS`            | comma list of tool names (default `echo,sleep,crash`)   |
//! | `MOCK_PAGE_SIZE`        | paginate `tools/list` with this many tools per page     |
//! | `MOCK_LAUNCH_LOG`       | append one line per launch to this file                 |
//! | `MOCK_FAIL_STARTUP`     | print the value to stderr and exit 1 before serving     |
//! | `MOCK_STARTUP_DELAY_MS` | sleep before serving                                    |
//! | `MOCK_NOISE`            | print a non-JSON log line before every response         |
//! | `MOCK_SPLIT`            | write every response in two chunks                      |
//! | `MOCK_PRETTY`           | pretty-print responses over several lines               |
//!
//! Tool names ending in `_bare` advertise `{"type":"object"}`, names ending
//! in `_noschema` advertise no schema at all.

use serde_json::{json, Value};
use std::env;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

fn flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| !v.is_empty() && v != "0")
}

fn tool_names() -> Vec<String> {
    env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "echo,sleep,crash".to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn tool_definition(name: &str) -> Value {
    if name.ends_with("_noschema") {
        return json!({"name": name, "description": format!("{name} without schema")});
    }
    if name.ends_with("_bare") {
        return json!({
            "name": name,
            "description": format!("{name} with a bare schema"),
            "inputSchema": {"type": "object"}
        });
    }
    match name {
        "sleep" => json!({
            "name": "sleep",
            "description": "Sleep for `ms` milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer", "minimum": 0}},
                "required": ["ms"]
            }
        }),
        _ => json!({
            "name": name,
            "description": format!("Mock tool {name}"),
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "additionalProperties": false
            },
            "annotations": {"readOnlyHint": true}
        }),
    }
}

fn list_tools(params: Option<&Value>) -> Value {
    let tools: Vec<Value> = tool_names().iter().map(|n| tool_definition(n)).collect();
    let page_size = env::var("MOCK_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0);

    let Some(page_size) = page_size else {
        return json!({ "tools": tools });
    };

    let start = params
        .and_then(|p| p.get("cursor"))
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    let end = (start + page_size).min(tools.len());
    let page = tools.get(start..end).unwrap_or_default().to_vec();
    if end < tools.len() {
        json!({ "tools": page, "nextCursor": end.to_string() })
    } else {
        json!({ "tools": page })
    }
}

fn text(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn call_tool(params: Option<&Value>) -> Result<Value, (i64, String)> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or((-32602, "missing tool name".to_string()))?;
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    if !tool_names().iter().any(|t| t == name) {
        return Err((-32602, format!("Unknown tool: {name}")));
    }

    match name {
        "echo" => {
            let echoed = arguments
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| arguments.to_string());
            Ok(text(echoed))
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(text(format!("slept {ms}ms")))
        }
        "crash" => {
            eprintln!("mock-backend: crashing on request");
            std::process::exit(2);
        }
        other => Ok(text(format!("called {other}"))),
    }
}

fn write_response(out: &mut impl Write, response: &Value) -> io::Result<()> {
    if flag("MOCK_NOISE") {
        writeln!(out, "[mock-backend] handling request")?;
    }

    let encoded = if flag("MOCK_PRETTY") {
        serde_json::to_string_pretty(response)?
    } else {
        serde_json::to_string(response)?
    };

    if flag("MOCK_SPLIT") && encoded.len() > 1 {
        let mut mid = encoded.len() / 2;
        while !encoded.is_char_boundary(mid) {
            mid += 1;
        }
        out.write_all(&encoded.as_bytes()[..mid])?;
        out.flush()?;
        thread::sleep(Duration::from_millis(20));
        out.write_all(&encoded.as_bytes()[mid..])?;
    } else {
        out.write_all(encoded.as_bytes())?;
    }
    out.write_all(b"\n")?;
    out.flush()
}

fn record_launch() -> io::Result<()> {
    if let Ok(path) = env::var("MOCK_LAUNCH_LOG") {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "launch {}", std::process::id())?;
    }
    Ok(())
}

fn main() -> io::Result<()> {
    record_launch()?;

    if let Ok(message) = env::var("MOCK_FAIL_STARTUP") {
        eprintln!("{message}");
        std::process::exit(1);
    }

    if let Some(delay) = env::var("MOCK_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        thread::sleep(Duration::from_millis(delay));
    }

    eprintln!("mock-backend: ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("mock-backend: ignoring unparseable input: {e}");
                continue;
            }
        };

        // Notifications get no reply.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = message.get("params");

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-backend", "version": env!("CARGO_PKG_VERSION")}
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(list_tools(params)),
            "tools/call" => call_tool(params),
            other => Err((-32601, format!("Method not found: {other}"))),
        };

        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        write_response(&mut out, &response)?;
    }

    Ok(())
}
