#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Client-facing transport: MCP over HTTP/SSE plus a status endpoint
//!
//! The bridge core is transport-agnostic; this crate adapts it to the
//! conventional SSE shape (`GET /sse` + `POST /messages`) and exposes
//! `/status` for operators.

mod sse;
mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use manifold_bridge::Bridge;
use tower_http::trace::TraceLayer;

pub use sse::SseSessions;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub sessions: SseSessions,
}

/// Build the HTTP application
pub fn app(bridge: Arc<Bridge>) -> Router {
    let state = AppState {
        bridge,
        sessions: SseSessions::default(),
    };

    Router::new()
        .route("/sse", get(sse::sse_handler))
        .route("/messages", post(sse::message_handler))
        .route("/status", get(status::status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assembled server bound to a listen address
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
}

impl Server {
    pub fn new(bridge: Arc<Bridge>, listen_address: SocketAddr) -> Self {
        Self {
            router: app(bridge),
            listen_address,
        }
    }

    /// Get the configured listen address
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Start serving requests
    ///
    /// Blocks until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        Ok(())
    }
}
