use std::path::PathBuf;

use clap::Parser;

/// Manifold MCP bridge
#[derive(Debug, Parser)]
#[command(name = "manifold", about = "One-to-many proxy for the Model Context Protocol")]
pub struct Args {
    /// Path to the bridge configuration file
    #[arg(short, long, default_value = "manifold.json", env = "MANIFOLD_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address from the config file
    #[arg(long, env = "MANIFOLD_LISTEN")]
    pub listen: Option<std::net::SocketAddr>,

    /// Default log filter; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    pub log: String,
}
