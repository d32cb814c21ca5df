#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use args::Args;
use clap::Parser;
use manifold_bridge::Bridge;
use manifold_config::Config;
use manifold_server::Server;
use tokio_util::sync::CancellationToken;

/// Exit code for invalid configuration
const EXIT_CONFIG: i32 = 2;
/// Exit code for an unrecoverable internal error
const EXIT_INTERNAL: i32 = 70;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            return EXIT_CONFIG;
        }
    };

    if let Err(e) = manifold_telemetry::init(&args.log) {
        eprintln!("failed to initialize logging: {e:#}");
        return EXIT_INTERNAL;
    }

    tracing::info!(
        config_path = %args.config.display(),
        backends = config.mcp_servers.len(),
        "starting manifold"
    );

    let listen = match listen_address(&args, &config) {
        Ok(listen) => listen,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let bridge = Arc::new(Bridge::start(config).await);

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let server = Server::new(Arc::clone(&bridge), listen);
    let served = server.serve(shutdown).await;

    bridge.shutdown().await;

    match served {
        Ok(()) => {
            tracing::info!("manifold stopped");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            EXIT_INTERNAL
        }
    }
}

fn listen_address(args: &Args, config: &Config) -> anyhow::Result<SocketAddr> {
    if let Some(listen) = args.listen {
        return Ok(listen);
    }
    let host: IpAddr = config
        .bridge
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("bridge host '{}' is invalid: {e}", config.bridge.host))?;
    Ok(SocketAddr::new(host, config.bridge.port))
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
