use manifold_core::{RpcError, codes};
use serde_json::Value;
use thiserror::Error;

/// Bridge engine errors
///
/// Backend-originated JSON-RPC errors travel through `BackendError` so the
/// router can put the original code, message, and data back on the wire
/// unchanged.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The backend process could not be spawned
    #[error("failed to spawn backend '{name}': {reason}")]
    Spawn { name: String, reason: String },

    /// The MCP initialize handshake failed
    #[error("handshake with backend '{name}' failed: {reason}")]
    Handshake { name: String, reason: String },

    /// The initial catalog fetch failed
    #[error("catalog fetch from backend '{name}' failed: {reason}")]
    Catalog { name: String, reason: String },

    /// A request exceeded its deadline; the session stays alive
    #[error("request to backend '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The backend process exited with the request in flight
    #[error("session with backend '{name}' closed")]
    SessionClosed { name: String },

    /// A liveness probe failed
    #[error("health probe for backend '{name}' failed: {reason}")]
    Probe { name: String, reason: String },

    /// The request names a method the bridge does not route
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// The request parameters are malformed
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    /// No ready backend can serve the identifier
    #[error("no ready backend for '{id}'")]
    BackendUnavailable { id: String },

    /// Catalog publication refused under the `error` policy
    #[error("catalog conflict on '{id}'")]
    CatalogConflict { id: String },

    /// The client cancelled the request
    #[error("request cancelled by client")]
    Cancelled,

    /// The backend answered with a JSON-RPC error; forwarded verbatim
    #[error("backend '{name}' returned error {code}: {message}")]
    BackendError {
        name: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Unexpected internal failure
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RpcError for BridgeError {
    fn code(&self) -> i64 {
        match self {
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::BackendUnavailable { .. } => codes::BACKEND_UNAVAILABLE,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::SessionClosed { .. } => codes::SESSION_CLOSED,
            Self::CatalogConflict { .. } => codes::CATALOG_CONFLICT,
            Self::Cancelled => codes::REQUEST_CANCELLED,
            Self::BackendError { code, .. } => *code,
            Self::Spawn { .. } | Self::Handshake { .. } | Self::Catalog { .. } => {
                codes::BACKEND_UNAVAILABLE
            }
            Self::Probe { .. } | Self::Internal { .. } => codes::INTERNAL_ERROR,
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::BackendError { message, .. } => message.clone(),
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases: [(BridgeError, i64); 5] = [
            (
                BridgeError::MethodNotFound {
                    method: "x".into(),
                },
                -32601,
            ),
            (
                BridgeError::BackendUnavailable { id: "a.b".into() },
                -32000,
            ),
            (
                BridgeError::Timeout {
                    name: "a".into(),
                    timeout_ms: 500,
                },
                -32001,
            ),
            (BridgeError::SessionClosed { name: "a".into() }, -32002),
            (BridgeError::CatalogConflict { id: "fetch".into() }, -32003),
        ];
        for (error, expected) in cases {
            assert_eq!(error.code(), expected);
        }
    }

    #[test]
    fn backend_errors_keep_their_code() {
        let error = BridgeError::BackendError {
            name: "a".into(),
            code: -32602,
            message: "bad arguments".into(),
            data: None,
        };
        assert_eq!(error.code(), -32602);
        assert_eq!(error.client_message(), "bad arguments");
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let error = BridgeError::Internal {
            reason: "pipe broke at fd 7".into(),
        };
        assert_eq!(error.client_message(), "internal error");
    }
}
