//! MCP over Server-Sent Events
//!
//! `GET /sse` opens a client session and streams responses; the first
//! event tells the client where to POST its messages. `POST /messages`
//! accepts one JSON-RPC envelope per call and returns 202; responses
//! travel back over the session's event stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use dashmap::DashMap;
use manifold_core::jsonrpc::RequestId;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};

use crate::AppState;

/// Buffered responses per client session
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Live SSE client sessions keyed by session id
pub type SseSessions = Arc<DashMap<String, mpsc::Sender<Event>>>;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `GET /sse`: open a session and stream queued responses
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Event>(SESSION_CHANNEL_CAPACITY);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={session_id}"));
    // Capacity is fresh, the send cannot fail
    let _ = tx.try_send(endpoint);

    state.sessions.insert(session_id.clone(), tx);
    tracing::debug!(session = %session_id, "client session opened");

    let stream = SessionStream {
        inner: ReceiverStream::new(rx),
        sessions: Arc::clone(&state.sessions),
        session_id,
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `POST /messages?sessionId=...`: accept one envelope
///
/// The response (when the envelope is a request) is pushed onto the
/// session's SSE stream. If the client disconnects mid-request, the
/// in-flight backend call is cancelled.
pub async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(envelope): Json<Value>,
) -> StatusCode {
    let Some(tx) = state
        .sessions
        .get(&query.session_id)
        .map(|entry| entry.value().clone())
    else {
        return StatusCode::NOT_FOUND;
    };

    let request_id = envelope
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    let bridge = Arc::clone(&state.bridge);

    tokio::spawn(async move {
        tokio::select! {
            response = bridge.handle_client_request(envelope) => {
                let Some(response) = response else { return };
                let data = match serde_json::to_string(&response) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize response");
                        return;
                    }
                };
                let event = Event::default().event("message").data(data);
                if tx.send(event).await.is_err() {
                    tracing::debug!("client disconnected before the response was sent");
                }
            }
            () = tx.closed() => {
                if let Some(id) = request_id {
                    tracing::debug!(%id, "client disconnected, cancelling request");
                    bridge.cancel_request(&id);
                }
            }
        }
    });

    StatusCode::ACCEPTED
}

/// Receiver stream that deregisters its session on drop
struct SessionStream {
    inner: ReceiverStream<Event>,
    sessions: SseSessions,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        tracing::debug!(session = %self.session_id, "client session closed");
    }
}
