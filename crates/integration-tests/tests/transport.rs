//! HTTP/SSE transport end to end

mod harness;

use std::sync::Arc;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use harness::config::{ConfigBuilder, mock_backend};
use harness::server::TestServer;
use harness::{request, wait_for_tool_count};
use manifold_bridge::Bridge;
use serde_json::{Value, json};

#[tokio::test]
async fn status_endpoint_reports_backends() {
    let config = ConfigBuilder::new()
        .backend("a", mock_backend("a", &["fetch", "search"]))
        .build();
    let bridge = Arc::new(Bridge::start(config).await);
    wait_for_tool_count(&bridge, 2).await;

    let server = TestServer::start(Arc::clone(&bridge)).await.unwrap();

    let response = server
        .client()
        .get(server.url("/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["backends"]["a"]["status"], "ready");
    assert_eq!(body["backends"]["a"]["tools"], 2);
    assert_eq!(body["catalog_conflict"], false);

    bridge.shutdown().await;
}

#[tokio::test]
async fn sse_session_round_trips_a_request() {
    let config = ConfigBuilder::new()
        .backend("a", mock_backend("a", &["fetch"]))
        .build();
    let bridge = Arc::new(Bridge::start(config).await);
    wait_for_tool_count(&bridge, 1).await;

    let server = TestServer::start(Arc::clone(&bridge)).await.unwrap();

    let response = server
        .client()
        .get(server.url("/sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut events = response.bytes_stream().eventsource();

    // First event tells us where to post messages
    let endpoint = events.next().await.unwrap().unwrap();
    assert_eq!(endpoint.event, "endpoint");
    assert!(endpoint.data.starts_with("/messages?sessionId="));
    let messages_url = server.url(&endpoint.data);

    let accepted = server
        .client()
        .post(&messages_url)
        .json(&request(1, "initialize", json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);

    let message = events.next().await.unwrap().unwrap();
    assert_eq!(message.event, "message");
    let envelope: Value = serde_json::from_str(&message.data).unwrap();
    assert_eq!(envelope["id"], 1);
    assert_eq!(envelope["result"]["serverInfo"]["name"], "manifold");

    // Tool invocations travel the same path
    let accepted = server
        .client()
        .post(&messages_url)
        .json(&request(
            2,
            "tools/call",
            json!({"name": "a.fetch", "arguments": {}}),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);

    let message = events.next().await.unwrap().unwrap();
    let envelope: Value = serde_json::from_str(&message.data).unwrap();
    assert_eq!(envelope["id"], 2);
    assert_eq!(
        envelope["result"]["content"][0]["text"],
        "fetch handled by a"
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let bridge = Arc::new(Bridge::start(ConfigBuilder::new().build()).await);
    let server = TestServer::start(Arc::clone(&bridge)).await.unwrap();

    let response = server
        .client()
        .post(server.url("/messages?sessionId=nope"))
        .json(&request(1, "ping", json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    bridge.shutdown().await;
}
