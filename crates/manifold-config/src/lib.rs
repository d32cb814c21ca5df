#![allow(clippy::must_use_candidate)]

pub mod backend;
pub mod bridge;
mod env;
mod loader;

use indexmap::IndexMap;
use serde::Deserialize;

pub use backend::*;
pub use bridge::*;
pub use env::expand_vars;

/// Top-level manifold configuration
///
/// Wire format is JSON with camelCase keys:
/// `{"mcpServers": {"<name>": {...}}, "bridge": {...}}`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Backend MCP server configurations keyed by name
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: IndexMap<String, BackendConfig>,
    /// Bridge-wide behavior
    #[serde(default)]
    pub bridge: BridgeSettings,
}
