//! One live conversation with a backend MCP server
//!
//! A session owns the child subprocess and its stdio. Framing is one JSON
//! object per line. A single reader task correlates responses to pending
//! requests by id; writes are serialized through a dedicated writer task.
//! stderr is drained to the log and never interpreted.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use manifold_config::{AggregationConfig, BackendConfig, expand_vars};
use manifold_core::jsonrpc::{Notification, Request, RequestId, Response};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::state::{CatalogSnapshot, DeclaredKinds};

/// MCP protocol revision the bridge negotiates on both sides
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Deadline for cleaning up a process whose handshake failed
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Events a session reports to its supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The child process exited or closed stdout
    Exited,
    /// The backend sent a `*/list_changed` notification
    CapabilityChanged,
}

/// A running backend session
#[derive(Debug)]
pub struct Session {
    name: String,
    config: Arc<BackendConfig>,
    aggregation: AggregationConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    declared: OnceLock<DeclaredKinds>,
}

impl Session {
    /// Spawn the backend, perform the initialize handshake, and fetch the
    /// initial catalog snapshot
    ///
    /// `events` receives [`SessionEvent::Exited`] when the process dies and
    /// capability-change events for unsolicited list-change notifications.
    pub async fn start(
        name: &str,
        config: Arc<BackendConfig>,
        aggregation: AggregationConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(Arc<Self>, CatalogSnapshot), BridgeError> {
        let mut cmd = Command::new(&config.command);
        for arg in &config.args {
            cmd.arg(expand_vars(arg));
        }
        cmd.env("MCP_BRIDGE_CHILD", "1");
        for (key, value) in &config.env {
            cmd.env(key, expand_vars(value));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so forced termination reaches grandchildren
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let spawn_error = |reason: &str| BridgeError::Spawn {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| spawn_error("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("stderr not captured"))?;
        let pid = child.id();

        tracing::debug!(
            backend = name,
            command = %config.command,
            pid = ?pid,
            "spawned backend process"
        );

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();

        // Writer task: owns stdin; one line per message, flushed
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outbox_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
            // Dropping stdin closes the child's input pipe
        });

        let session = Arc::new(Self {
            name: name.to_string(),
            config,
            aggregation,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Some(outbox_tx)),
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            declared: OnceLock::new(),
        });

        // stderr task: attach to the log, never interpret
        {
            let backend = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = %backend, "stderr: {line}");
                }
            });
        }

        // Reader task: correlate responses, surface notifications
        {
            let session = Arc::clone(&session);
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => session.dispatch_line(&line, &events),
                        Ok(None) | Err(_) => break,
                    }
                }
                session.fail_pending();
                let _ = events.send(SessionEvent::Exited);
            });
        }

        match session.handshake().await {
            Ok(snapshot) => Ok((session, snapshot)),
            Err(e) => {
                session.stop(ABORT_GRACE).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<CatalogSnapshot, BridgeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "manifold",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request("initialize", Some(params), self.config.request_timeout())
            .await
            .map_err(|e| BridgeError::Handshake {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let kinds = DeclaredKinds {
            tools: result.pointer("/capabilities/tools").is_some(),
            resources: result.pointer("/capabilities/resources").is_some(),
            prompts: result.pointer("/capabilities/prompts").is_some(),
        };
        let _ = self.declared.set(kinds);

        self.notify("notifications/initialized", None).await?;

        self.fetch_catalog().await
    }

    /// Fetch the catalog lists this backend declares, subject to the
    /// bridge's aggregation toggles
    pub async fn fetch_catalog(&self) -> Result<CatalogSnapshot, BridgeError> {
        let kinds = self.declared.get().copied().unwrap_or_default();
        let timeout = self.config.request_timeout();
        let mut snapshot = CatalogSnapshot {
            kinds,
            ..CatalogSnapshot::default()
        };

        if self.aggregation.tools && kinds.tools {
            snapshot.tools = self.fetch_list("tools/list", "tools", timeout).await?;
        }
        if self.aggregation.resources && kinds.resources {
            snapshot.resources = self.fetch_list("resources/list", "resources", timeout).await?;
        }
        if self.aggregation.prompts && kinds.prompts {
            snapshot.prompts = self.fetch_list("prompts/list", "prompts", timeout).await?;
        }

        tracing::debug!(
            backend = %self.name,
            tools = snapshot.tools.len(),
            resources = snapshot.resources.len(),
            prompts = snapshot.prompts.len(),
            "fetched catalog snapshot"
        );

        Ok(snapshot)
    }

    async fn fetch_list(
        &self,
        method: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Vec<Value>, BridgeError> {
        let result = self
            .request(method, None, timeout)
            .await
            .map_err(|e| BridgeError::Catalog {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(result
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Issue a request and await the correlated response or the deadline
    ///
    /// On deadline expiry the pending entry is removed and the session
    /// stays alive; a late reply is discarded by the reader task.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.request_cancellable(method, params, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`Self::request`], but also unblocks when `cancel` fires,
    /// forwarding `notifications/cancelled` to the backend
    pub async fn request_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(RequestId::Number(id), method, params);
        let line = serde_json::to_string(&request).map_err(|e| BridgeError::Internal {
            reason: format!("failed to serialize request: {e}"),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending_table().insert(id, tx);
        if let Err(e) = self.send_line(line) {
            self.pending_table().remove(&id);
            return Err(e);
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.pending_table().remove(&id);
                let _ = self
                    .notify(
                        "notifications/cancelled",
                        Some(json!({"requestId": id, "reason": "client cancelled"})),
                    )
                    .await;
                Err(BridgeError::Cancelled)
            }
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(response)) => {
                    if let Some(error) = response.error {
                        Err(BridgeError::BackendError {
                            name: self.name.clone(),
                            code: error.code,
                            message: error.message,
                            data: error.data,
                        })
                    } else {
                        Ok(response.result.unwrap_or(Value::Null))
                    }
                }
                // Sender dropped: the reader task observed process exit
                Ok(Err(_)) => Err(BridgeError::SessionClosed {
                    name: self.name.clone(),
                }),
                Err(_) => {
                    self.pending_table().remove(&id);
                    Err(BridgeError::Timeout {
                        name: self.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BridgeError> {
        let notification = Notification::new(method, params);
        let line = serde_json::to_string(&notification).map_err(|e| BridgeError::Internal {
            reason: format!("failed to serialize notification: {e}"),
        })?;
        self.send_line(line)
    }

    /// Close stdin, wait up to `grace` for exit, then kill the process
    /// group; all pending requests complete with `SessionClosed`
    pub async fn stop(&self, grace: Duration) {
        // Closing the outbox ends the writer task and with it stdin
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(backend = %self.name, %status, "backend exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.name, error = %e, "failed to reap backend");
                }
                Err(_) => {
                    tracing::warn!(
                        backend = %self.name,
                        grace_ms = grace.as_millis() as u64,
                        "grace period expired, killing process group"
                    );
                    self.kill_process_group();
                    let _ = child.kill().await;
                }
            }
        }
        drop(guard);

        self.fail_pending();
    }

    #[cfg(unix)]
    fn kill_process_group(&self) {
        if let Some(pid) = self.pid {
            // The child was spawned as its own group leader
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&self) {}

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pending_table(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_line(&self, line: String) -> Result<(), BridgeError> {
        let sender = self
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let closed = || BridgeError::SessionClosed {
            name: self.name.clone(),
        };
        sender.ok_or_else(closed)?.send(line).map_err(|_| closed())
    }

    /// Route one stdout line: response, notification, or noise
    fn dispatch_line(&self, line: &str, events: &mpsc::UnboundedSender<SessionEvent>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            tracing::warn!(backend = %self.name, "discarding unparseable stdout line");
            return;
        };

        if value.get("method").is_some() {
            if value.get("id").is_some_and(|id| !id.is_null()) {
                // Server-initiated request (e.g. sampling); not supported
                tracing::debug!(backend = %self.name, "ignoring backend-initiated request");
            } else {
                self.dispatch_notification(&value, events);
            }
            return;
        }

        let Ok(response) = serde_json::from_value::<Response>(value) else {
            tracing::warn!(backend = %self.name, "discarding malformed response");
            return;
        };
        let Some(RequestId::Number(id)) = response.id else {
            tracing::warn!(backend = %self.name, "discarding response with foreign id");
            return;
        };
        match self.pending_table().remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    backend = %self.name,
                    id,
                    "no pending entry for response (deadline already expired)"
                );
            }
        }
    }

    fn dispatch_notification(&self, value: &Value, events: &mpsc::UnboundedSender<SessionEvent>) {
        let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
        match method {
            "notifications/tools/list_changed"
            | "notifications/resources/list_changed"
            | "notifications/prompts/list_changed" => {
                let _ = events.send(SessionEvent::CapabilityChanged);
            }
            other => {
                tracing::debug!(backend = %self.name, method = other, "ignoring backend notification");
            }
        }
    }

    /// Complete every pending request with `SessionClosed` by dropping its
    /// completion handle
    fn fail_pending(&self) {
        let dropped = {
            let mut pending = self.pending_table();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            tracing::warn!(
                backend = %self.name,
                count = dropped,
                "session closed with requests in flight"
            );
        }
    }
}
