#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
pub mod jsonrpc;

pub use error::{RpcError, codes};
