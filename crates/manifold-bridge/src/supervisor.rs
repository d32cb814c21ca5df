//! Per-backend availability state machine
//!
//! One supervisor task per enabled backend: starts the session, probes it
//! on the configured interval, degrades and fails it on probe failures,
//! and restarts it with jittered exponential backoff. Transitions into
//! and out of `Ready` are published to the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use manifold_config::{BridgeSettings, ProbeOperation};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::registry::RegistryEvent;
use crate::session::{Session, SessionEvent};
use crate::state::{Backend, BackendStatus};

/// Upper bound on reconnect backoff
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Grace period for session shutdown
const STOP_GRACE: Duration = Duration::from_secs(5);

enum SuperviseOutcome {
    Failed,
    Shutdown,
}

/// Drives one backend through its lifecycle
pub struct Supervisor {
    backend: Arc<Backend>,
    settings: Arc<BridgeSettings>,
    registry_events: mpsc::Sender<RegistryEvent>,
    shutdown: CancellationToken,
    ready_counter: Arc<AtomicU64>,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn spawn(
        backend: Arc<Backend>,
        settings: Arc<BridgeSettings>,
        registry_events: mpsc::Sender<RegistryEvent>,
        shutdown: CancellationToken,
        ready_counter: Arc<AtomicU64>,
        http: reqwest::Client,
    ) -> JoinHandle<()> {
        let supervisor = Self {
            backend,
            settings,
            registry_events,
            shutdown,
            ready_counter,
            http,
        };
        tokio::spawn(supervisor.run())
    }

    async fn run(self) {
        let mut ever_ready = false;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.start_backend().await {
                Ok(events) => {
                    ever_ready = true;
                    match self.supervise(events).await {
                        SuperviseOutcome::Shutdown => break,
                        SuperviseOutcome::Failed => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        backend = %self.backend.name,
                        error = %e,
                        "backend failed to start"
                    );
                }
            }

            // Now in `Failed`; decide whether and when to try again
            let Some(delay) = self.next_retry_delay(ever_ready).await else {
                tracing::error!(
                    backend = %self.backend.name,
                    "backend failed permanently, awaiting shutdown"
                );
                self.shutdown.cancelled().await;
                break;
            };

            tracing::info!(
                backend = %self.backend.name,
                delay_ms = delay.as_millis() as u64,
                "scheduling backend restart"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.stop_backend().await;
    }

    /// Spawn the session and transition `Starting` → `Ready` or `Failed`
    async fn start_backend(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>, BridgeError> {
        {
            let mut state = self.backend.state.write().await;
            state.status = BackendStatus::Starting;
            state.session = None;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let started = Session::start(
            &self.backend.name,
            Arc::clone(&self.backend.config),
            self.settings.aggregation,
            events_tx,
        )
        .await;

        match started {
            Ok((session, snapshot)) => {
                {
                    let mut state = self.backend.state.write().await;
                    state.status = BackendStatus::Ready;
                    state.session = Some(session);
                    state.snapshot = snapshot;
                    state.consecutive_failures = 0;
                    state.last_success = Some(Instant::now());
                    state.next_retry_at = None;
                    state.ready_seq = Some(self.ready_counter.fetch_add(1, Ordering::Relaxed));
                }
                tracing::info!(backend = %self.backend.name, "backend ready");
                self.publish_readiness(true).await;
                Ok(events_rx)
            }
            Err(e) => {
                {
                    let mut state = self.backend.state.write().await;
                    state.status = BackendStatus::Failed;
                    state.session = None;
                    state.last_failure = Some(Instant::now());
                }
                self.publish_readiness(false).await;
                Err(e)
            }
        }
    }

    /// Probe loop while the backend is `Ready` or `Degraded`
    async fn supervise(
        &self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> SuperviseOutcome {
        let health = &self.backend.config.health_check;
        let mut probe_timer =
            tokio::time::interval(Duration::from_millis(health.interval.max(10)));
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the backend just passed
        // its handshake, so skip it
        probe_timer.tick().await;

        let mut sustained = false;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return SuperviseOutcome::Shutdown,
                event = events.recv() => match event {
                    Some(SessionEvent::CapabilityChanged) => self.refresh_catalog().await,
                    Some(SessionEvent::Exited) | None => {
                        tracing::warn!(backend = %self.backend.name, "backend process exited");
                        self.mark_failed().await;
                        return SuperviseOutcome::Failed;
                    }
                },
                _ = probe_timer.tick(), if health.enabled => {
                    match self.probe().await {
                        Ok(()) => {
                            if !sustained {
                                // One full interval in Ready: the restart
                                // budget resets
                                sustained = true;
                                self.backend.state.write().await.restart_attempts = 0;
                            }
                            self.record_probe_success().await;
                        }
                        Err(e) => {
                            tracing::warn!(
                                backend = %self.backend.name,
                                error = %e,
                                "health probe failed"
                            );
                            if self.record_probe_failure().await {
                                self.mark_failed().await;
                                return SuperviseOutcome::Failed;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn record_probe_success(&self) {
        let became_ready = {
            let mut state = self.backend.state.write().await;
            state.consecutive_failures = 0;
            state.last_success = Some(Instant::now());
            if state.status == BackendStatus::Degraded {
                state.status = BackendStatus::Ready;
                state.ready_seq = Some(self.ready_counter.fetch_add(1, Ordering::Relaxed));
                true
            } else {
                false
            }
        };
        if became_ready {
            tracing::info!(backend = %self.backend.name, "backend recovered");
            self.publish_readiness(true).await;
        }
    }

    /// Returns true when the failure budget is exhausted
    async fn record_probe_failure(&self) -> bool {
        let max_failures = self.max_consecutive_failures();
        let (left_ready, exhausted) = {
            let mut state = self.backend.state.write().await;
            state.consecutive_failures += 1;
            state.last_failure = Some(Instant::now());
            let left_ready = if state.status == BackendStatus::Ready {
                state.status = BackendStatus::Degraded;
                true
            } else {
                false
            };
            (left_ready, state.consecutive_failures >= max_failures)
        };
        if left_ready {
            tracing::warn!(backend = %self.backend.name, "backend degraded");
            self.publish_readiness(false).await;
        }
        exhausted
    }

    /// The backend override when present, otherwise the bridge-wide
    /// failover threshold
    fn max_consecutive_failures(&self) -> u32 {
        let health = &self.backend.config.health_check;
        if health.enabled {
            health.max_consecutive_failures
        } else {
            self.settings.failover.max_failures
        }
        .max(1)
    }

    async fn mark_failed(&self) {
        let session = {
            let mut state = self.backend.state.write().await;
            state.status = BackendStatus::Failed;
            state.last_failure = Some(Instant::now());
            state.session.take()
        };
        if let Some(session) = session {
            session.stop(STOP_GRACE).await;
        }
        tracing::warn!(backend = %self.backend.name, "backend failed");
        self.publish_readiness(false).await;
    }

    /// Refetch the catalog after a list-changed notification
    async fn refresh_catalog(&self) {
        let session = self.backend.state.read().await.session.clone();
        let Some(session) = session else { return };

        match session.fetch_catalog().await {
            Ok(snapshot) => {
                self.backend.state.write().await.snapshot = snapshot;
                self.send_event(RegistryEvent::CapabilityChanged {
                    backend: self.backend.name.clone(),
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(
                    backend = %self.backend.name,
                    error = %e,
                    "failed to refresh catalog after change notification"
                );
            }
        }
    }

    /// Execute the configured liveness probe
    ///
    /// Probes go through the session like any other request and never
    /// block user traffic.
    async fn probe(&self) -> Result<(), BridgeError> {
        let health = &self.backend.config.health_check;
        let timeout = Duration::from_millis(health.timeout.max(1));
        let session = self
            .backend
            .state
            .read()
            .await
            .session
            .clone()
            .ok_or_else(|| BridgeError::SessionClosed {
                name: self.backend.name.clone(),
            })?;

        let fallback = |why: &str| {
            tracing::warn!(
                backend = %self.backend.name,
                "{why}, falling back to tools/list"
            );
        };

        match health.operation {
            ProbeOperation::ListTools => {
                session.request("tools/list", None, timeout).await.map(drop)
            }
            ProbeOperation::ListResources => {
                session.request("resources/list", None, timeout).await.map(drop)
            }
            ProbeOperation::ListPrompts => {
                session.request("prompts/list", None, timeout).await.map(drop)
            }
            ProbeOperation::CallTool => match &health.tool_name {
                Some(tool) => {
                    let params = json!({
                        "name": tool,
                        "arguments": health.tool_arguments.clone().unwrap_or_else(|| json!({})),
                    });
                    session.request("tools/call", Some(params), timeout).await.map(drop)
                }
                None => {
                    fallback("call_tool probe has no toolName");
                    session.request("tools/list", None, timeout).await.map(drop)
                }
            },
            ProbeOperation::ReadResource => match &health.resource_uri {
                Some(uri) => {
                    let params = json!({"uri": uri});
                    session
                        .request("resources/read", Some(params), timeout)
                        .await
                        .map(drop)
                }
                None => {
                    fallback("read_resource probe has no resourceUri");
                    session.request("tools/list", None, timeout).await.map(drop)
                }
            },
            ProbeOperation::GetPrompt => match &health.prompt_name {
                Some(prompt) => {
                    let params = json!({
                        "name": prompt,
                        "arguments": health.prompt_arguments.clone().unwrap_or_else(|| json!({})),
                    });
                    session.request("prompts/get", Some(params), timeout).await.map(drop)
                }
                None => {
                    fallback("get_prompt probe has no promptName");
                    session.request("tools/list", None, timeout).await.map(drop)
                }
            },
            ProbeOperation::Ping => match &health.url {
                Some(url) => self.http_probe(url, timeout).await,
                None => {
                    fallback("ping probe has no url");
                    session.request("tools/list", None, timeout).await.map(drop)
                }
            },
        }
    }

    async fn http_probe(&self, url: &str, timeout: Duration) -> Result<(), BridgeError> {
        let health = &self.backend.config.health_check;
        let probe_error = |reason: String| BridgeError::Probe {
            name: self.backend.name.clone(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| probe_error(format!("GET {url} failed: {e}")))?;

        let status = response.status().as_u16();
        if status != health.expected_status {
            return Err(probe_error(format!(
                "GET {url} returned {status}, expected {}",
                health.expected_status
            )));
        }

        if let Some(needle) = &health.expected_content {
            let body = response
                .text()
                .await
                .map_err(|e| probe_error(format!("failed to read body: {e}")))?;
            if !body.contains(needle.as_str()) {
                return Err(probe_error(format!(
                    "response body does not contain '{needle}'"
                )));
            }
        }

        Ok(())
    }

    /// Decide the delay before the next start attempt, or `None` when the
    /// backend should stay `Failed` until administrative action
    ///
    /// Restarts are budgeted by `maxRestartAttempts` once the backend has
    /// been ready, and by `retryAttempts` while it never came up. Delays
    /// start at `restartDelay`, follow doubled `retryDelay` once that
    /// exceeds it, cap at 30 s, and carry ±20% jitter.
    async fn next_retry_delay(&self, ever_ready: bool) -> Option<Duration> {
        let config = &self.backend.config;
        let health = &config.health_check;

        let budget = if ever_ready {
            health.max_restart_attempts
        } else {
            config.retry_attempts
        };

        let mut state = self.backend.state.write().await;
        let delay = if health.auto_restart && state.restart_attempts < budget {
            let shift = state.restart_attempts.min(16);
            let doubled = config.retry_delay.saturating_mul(1 << shift);
            Duration::from_millis(
                doubled
                    .max(health.restart_delay)
                    .min(MAX_BACKOFF.as_millis() as u64),
            )
        } else if self.settings.failover.enabled {
            Duration::from_millis(self.settings.failover.recovery_interval.max(1))
        } else {
            state.next_retry_at = None;
            return None;
        };

        let delay = with_jitter(delay);
        state.restart_attempts += 1;
        state.next_retry_at = Some(Instant::now() + delay);
        Some(delay)
    }

    /// Shutdown path: `Stopping` → `Stopped`
    async fn stop_backend(&self) {
        let session = {
            let mut state = self.backend.state.write().await;
            if state.status == BackendStatus::Disabled {
                return;
            }
            state.status = BackendStatus::Stopping;
            state.session.take()
        };

        if let Some(session) = session {
            session.stop(STOP_GRACE).await;
        }

        let mut state = self.backend.state.write().await;
        state.status = BackendStatus::Stopped;
        state.snapshot = Default::default();
        tracing::info!(backend = %self.backend.name, "backend stopped");
    }

    async fn publish_readiness(&self, ready: bool) {
        self.send_event(RegistryEvent::Readiness {
            backend: self.backend.name.clone(),
            ready,
        })
        .await;
    }

    async fn send_event(&self, event: RegistryEvent) {
        if self.registry_events.send(event).await.is_err() {
            tracing::debug!(backend = %self.backend.name, "registry event channel closed");
        }
    }
}

/// ±20% so simultaneous failures do not restart in lockstep
fn with_jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::rng().random_range(0.8..=1.2))
}
