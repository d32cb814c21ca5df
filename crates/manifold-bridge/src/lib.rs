#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! The multiplexing engine: one MCP endpoint in front, N supervised
//! backend MCP servers behind it.
//!
//! A [`Bridge`] owns the configured backends. Each enabled backend gets a
//! [`session::Session`] (subprocess + line-delimited JSON-RPC) and a
//! [`supervisor::Supervisor`] (liveness probing, restart with backoff).
//! Readiness changes feed the [`registry::Registry`], which publishes an
//! immutable namespaced catalog; the [`router::Router`] resolves inbound
//! requests against it and forwards them to the owning session.

pub mod controller;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod supervisor;

pub use controller::{BackendReport, Bridge, StatusReport};
pub use error::BridgeError;
pub use registry::Registry;
pub use state::{Backend, BackendStatus};
