//! Scriptable MCP backend for integration tests
//!
//! Speaks line-delimited JSON-RPC on stdio. Behavior is configured
//! through environment variables:
//!
//! - `MOCK_NAME`: server name reported in `initialize` and tool results
//! - `MOCK_TOOLS`: comma-separated tool names to advertise
//! - `MOCK_INIT_DELAY_MS`: sleep before answering `initialize`
//! - `MOCK_CRASH_ONCE_FILE`: crash with exit code 1 on the first
//!   `tools/call`, but only while this marker file does not exist yet
//!
//! Per-call behavior is driven by tool arguments: `delay_ms` delays the
//! response, and the `getenv` tool echoes an environment variable back.

use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{Value, json};

fn main() {
    let name = std::env::var("MOCK_NAME").unwrap_or_else(|_| "mock".to_string());
    let tools: Vec<String> = std::env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    let init_delay = std::env::var("MOCK_INIT_DELAY_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0);
    let crash_once_file = std::env::var("MOCK_CRASH_ONCE_FILE").ok();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(envelope) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        let method = envelope.get("method").and_then(Value::as_str).unwrap_or_default();
        let id = envelope.get("id").cloned();
        let params = envelope.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                if init_delay > 0 {
                    std::thread::sleep(Duration::from_millis(init_delay));
                }
                respond(
                    id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                        "serverInfo": {"name": name, "version": "0.0.1"},
                    }),
                );
            }
            "tools/list" => {
                let descriptors: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool,
                            "description": format!("{tool} on {name}"),
                            "inputSchema": {"type": "object"},
                        })
                    })
                    .collect();
                respond(id, json!({"tools": descriptors}));
            }
            "resources/list" => respond(id, json!({"resources": []})),
            "prompts/list" => respond(id, json!({"prompts": []})),
            "tools/call" => {
                if let Some(marker) = &crash_once_file {
                    if !std::path::Path::new(marker).exists() {
                        let _ = std::fs::write(marker, b"crashed");
                        std::process::exit(1);
                    }
                }

                let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

                if let Some(delay) = arguments.get("delay_ms").and_then(Value::as_u64) {
                    std::thread::sleep(Duration::from_millis(delay));
                }

                let text = if tool == "getenv" {
                    let variable = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
                    std::env::var(variable).unwrap_or_default()
                } else {
                    format!("{tool} handled by {name}")
                };

                respond(
                    id,
                    json!({"content": [{"type": "text", "text": text}], "isError": false}),
                );
            }
            "logging/setLevel" => respond(id, json!({})),
            "completion/complete" => respond(
                id,
                json!({"completion": {"values": [format!("{name}-completion")], "hasMore": false}}),
            ),
            // Notifications carry no id and get no reply
            _ => {
                if let Some(id) = id {
                    respond_error(id, -32601, &format!("method not found: {method}"));
                }
            }
        }
    }
}

fn respond(id: Option<Value>, result: Value) {
    let Some(id) = id else { return };
    emit(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn respond_error(id: Value, code: i64, message: &str) {
    emit(&json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}));
}

fn emit(envelope: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{envelope}");
    let _ = stdout.flush();
}
