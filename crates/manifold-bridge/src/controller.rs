//! Top-level supervision and the client-facing entry point

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use manifold_config::Config;
use manifold_core::jsonrpc::{Message, Response};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::router::Router;
use crate::state::{Backend, BackendStatus};
use crate::supervisor::Supervisor;

/// Capacity of the supervisor → registry event channel
const REGISTRY_EVENT_CAPACITY: usize = 64;

/// How long shutdown waits for supervisors to wind down
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// The assembled bridge: backends, supervisors, registry, and router
pub struct Bridge {
    backends: Vec<Arc<Backend>>,
    registry: Arc<Registry>,
    router: Arc<Router>,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Build the bridge and start every enabled backend
    ///
    /// Returns immediately; backends connect in the background and the
    /// registry publishes the catalog once the initial round settles.
    pub async fn start(config: Config) -> Self {
        let settings = Arc::new(config.bridge);
        let shutdown = CancellationToken::new();

        let backends: Vec<Arc<Backend>> = config
            .mcp_servers
            .into_iter()
            .map(|(name, backend_config)| Arc::new(Backend::new(name, backend_config)))
            .collect();

        tracing::info!(
            configured = backends.len(),
            enabled = backends.iter().filter(|b| b.config.enabled).count(),
            "starting bridge"
        );

        let registry = Arc::new(Registry::new(backends.clone(), Arc::clone(&settings)));
        let (events_tx, events_rx) = mpsc::channel(REGISTRY_EVENT_CAPACITY);

        let mut tasks = vec![Registry::spawn(
            Arc::clone(&registry),
            events_rx,
            shutdown.clone(),
        )];

        let ready_counter = Arc::new(AtomicU64::new(0));
        let http = reqwest::Client::new();
        for backend in backends.iter().filter(|b| b.config.enabled) {
            tasks.push(Supervisor::spawn(
                Arc::clone(backend),
                Arc::clone(&settings),
                events_tx.clone(),
                shutdown.clone(),
                Arc::clone(&ready_counter),
                http.clone(),
            ));
        }

        let router = Arc::new(Router::new(
            backends.clone(),
            Arc::clone(&registry),
            settings,
        ));

        Self {
            backends,
            registry,
            router,
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        }
    }

    /// Handle one inbound envelope
    ///
    /// Requests produce a response envelope; notifications produce
    /// nothing; unparseable input produces a parse-error response.
    pub async fn handle_client_request(&self, envelope: Value) -> Option<Value> {
        let message = match Message::from_value(envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "received unparseable envelope");
                return serde_json::to_value(Response::parse_error(e.to_string())).ok();
            }
        };

        match message {
            Message::Request(request) => {
                let response = self.router.handle(request).await;
                serde_json::to_value(response).ok()
            }
            Message::Notification(notification) => {
                self.router.handle_notification(notification).await;
                None
            }
            Message::Response(_) => {
                // Clients have nothing to respond to; the bridge never
                // issues requests toward them
                tracing::debug!("ignoring response envelope from client");
                None
            }
        }
    }

    /// Cancel an in-flight request, e.g. when the client transport closes
    pub fn cancel_request(&self, id: &manifold_core::jsonrpc::RequestId) {
        self.router.cancel(id);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Per-backend health and catalog summary for the status endpoint
    pub async fn status_report(&self) -> StatusReport {
        let mut backends = IndexMap::new();
        for backend in &self.backends {
            let state = backend.state.read().await;
            backends.insert(
                backend.name.clone(),
                BackendReport {
                    status: state.status,
                    consecutive_failures: state.consecutive_failures,
                    restart_attempts: state.restart_attempts,
                    last_success_secs_ago: state.last_success.map(secs_ago),
                    last_failure_secs_ago: state.last_failure.map(secs_ago),
                    next_retry_in_secs: state
                        .next_retry_at
                        .map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
                    tools: state.snapshot.tools.len(),
                    resources: state.snapshot.resources.len(),
                    prompts: state.snapshot.prompts.len(),
                    command: backend.config.command.clone(),
                    priority: backend.config.priority,
                    tags: backend.config.tags.clone(),
                    health_check_enabled: backend.config.health_check.enabled,
                    auto_restart: backend.config.health_check.auto_restart,
                },
            );
        }

        StatusReport {
            catalog_conflict: self.registry.is_conflicted(),
            backends,
        }
    }

    /// Orderly shutdown: cancel all tasks, then wait for supervisors to
    /// stop their sessions within the grace period
    pub async fn shutdown(&self) {
        tracing::info!("shutting down bridge");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("task did not stop within the shutdown timeout");
            }
        }

        tracing::info!("bridge stopped");
    }

    /// Convenience for tests and the status endpoint
    pub async fn backend_status(&self, name: &str) -> Option<BackendStatus> {
        let backend = self.backends.iter().find(|b| b.name == name)?;
        Some(backend.status().await)
    }
}

fn secs_ago(instant: Instant) -> u64 {
    instant.elapsed().as_secs()
}

/// Bridge-wide status summary
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// True while the `error` policy is refusing to publish
    pub catalog_conflict: bool,
    pub backends: IndexMap<String, BackendReport>,
}

/// One backend's slice of the status report
#[derive(Debug, Serialize)]
pub struct BackendReport {
    pub status: BackendStatus,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub last_success_secs_ago: Option<u64>,
    pub last_failure_secs_ago: Option<u64>,
    pub next_retry_in_secs: Option<u64>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub command: String,
    pub priority: u32,
    pub tags: Vec<String>,
    pub health_check_enabled: bool,
    pub auto_restart: bool,
}
