/// Stable JSON-RPC error codes emitted by the bridge
///
/// The negative-32000 block is reserved for implementation-defined server
/// errors; clients key off these values, so they must never change.
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
    /// No ready backend can serve the request
    pub const BACKEND_UNAVAILABLE: i64 = -32000;
    /// The request exceeded its deadline
    pub const TIMEOUT: i64 = -32001;
    /// The backend process exited while the request was in flight
    pub const SESSION_CLOSED: i64 = -32002;
    /// Catalog publication refused under the `error` conflict policy
    pub const CATALOG_CONFLICT: i64 = -32003;
    /// The client cancelled the request
    pub const REQUEST_CANCELLED: i64 = -32800;
}

/// Trait for domain errors that can be converted to JSON-RPC error responses
///
/// Implemented by each feature crate's error type. The router converts
/// these into actual error objects on the wire, keeping domain errors
/// decoupled from envelope construction.
pub trait RpcError: std::error::Error {
    /// Stable JSON-RPC error code for this error
    fn code(&self) -> i64;

    /// Message safe to expose to clients
    fn client_message(&self) -> String;
}
