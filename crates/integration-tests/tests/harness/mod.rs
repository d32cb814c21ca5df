//! Shared helpers for bridge integration tests
#![allow(dead_code)]

pub mod config;
pub mod server;

use std::time::Duration;

use manifold_bridge::{BackendStatus, Bridge};
use serde_json::{Value, json};

/// How long helpers poll before giving up
const WAIT_DEADLINE: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Build a JSON-RPC request envelope
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Dispatch a request through the bridge and return the response envelope
pub async fn call(bridge: &Bridge, id: u64, method: &str, params: Value) -> Value {
    bridge
        .handle_client_request(request(id, method, params))
        .await
        .expect("requests always produce a response")
}

/// Text content of the first block in a tools/call result
pub fn result_text(response: &Value) -> &str {
    response
        .pointer("/result/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Poll until the backend reaches the wanted status
pub async fn wait_for_status(bridge: &Bridge, backend: &str, status: BackendStatus) {
    let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
    loop {
        if bridge.backend_status(backend).await == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend '{backend}' did not reach {status} in time"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until tools/list reports the wanted number of entries
pub async fn wait_for_tool_count(bridge: &Bridge, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
    loop {
        let response = call(bridge, 0, "tools/list", json!({})).await;
        let listed = response
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        if listed == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "catalog never reached {count} tools (last saw {listed})"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the registry reports a catalog conflict
pub async fn wait_for_conflict(bridge: &Bridge) {
    let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
    loop {
        if bridge.status_report().await.catalog_conflict {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reported a catalog conflict"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
