//! Operator-facing status endpoint

use axum::Json;
use axum::extract::State;
use manifold_bridge::StatusReport;

use crate::AppState;

/// `GET /status`: per-backend health, counters, and catalog sizes
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.bridge.status_report().await)
}
