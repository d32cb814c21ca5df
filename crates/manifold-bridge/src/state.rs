//! Per-backend mutable state and catalog snapshots

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use manifold_config::BackendConfig;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::session::Session;

/// Availability of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Excluded by configuration; terminal until reconfigured
    Disabled,
    /// Not yet started
    Stopped,
    /// Spawn and handshake in progress
    Starting,
    /// Serving requests with an in-date catalog snapshot
    Ready,
    /// Alive but failing probes
    Degraded,
    /// Process dead or probes exhausted
    Failed,
    /// Shutdown in progress
    Stopping,
}

impl BackendStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        }
    }

    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability kinds a backend declared during the initialize handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclaredKinds {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

/// Last-known catalog of one backend, replaced wholesale on readiness
/// transitions and capability-change notifications
///
/// Entries are the descriptors exactly as the backend delivered them;
/// tools and prompts are keyed by their `name` field, resources by `uri`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub kinds: DeclaredKinds,
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}

/// Capability kind, used to pick identifier fields and namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    /// Which descriptor field carries the native identifier
    pub const fn id_field(self) -> &'static str {
        match self {
            Self::Tool | Self::Prompt => "name",
            Self::Resource => "uri",
        }
    }
}

impl CatalogSnapshot {
    pub fn entries(&self, kind: CapabilityKind) -> &[Value] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    /// Whether this snapshot advertises the given native identifier
    pub fn contains(&self, kind: CapabilityKind, native_id: &str) -> bool {
        self.entries(kind)
            .iter()
            .any(|entry| entry.get(kind.id_field()).and_then(Value::as_str) == Some(native_id))
    }
}

/// Mutable state of one backend, owned by its supervisor
#[derive(Debug)]
pub struct BackendState {
    pub status: BackendStatus,
    pub session: Option<Arc<Session>>,
    pub snapshot: CatalogSnapshot,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub next_retry_at: Option<Instant>,
    /// Monotonic order of entering `Ready`, for the `first` policy
    pub ready_seq: Option<u64>,
}

/// A configured backend and its live state
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub config: Arc<BackendConfig>,
    pub state: RwLock<BackendState>,
}

impl Backend {
    pub fn new(name: String, config: BackendConfig) -> Self {
        let status = if config.enabled {
            BackendStatus::Stopped
        } else {
            BackendStatus::Disabled
        };
        Self {
            name,
            config: Arc::new(config),
            state: RwLock::new(BackendState {
                status,
                session: None,
                snapshot: CatalogSnapshot::default(),
                consecutive_failures: 0,
                restart_attempts: 0,
                last_success: None,
                last_failure: None,
                next_retry_at: None,
                ready_seq: None,
            }),
        }
    }

    pub async fn status(&self) -> BackendStatus {
        self.state.read().await.status
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn snapshot_contains_by_kind_field() {
        let snapshot = CatalogSnapshot {
            tools: vec![json!({"name": "fetch"})],
            resources: vec![json!({"uri": "file:///a", "name": "a"})],
            ..Default::default()
        };
        assert!(snapshot.contains(CapabilityKind::Tool, "fetch"));
        assert!(!snapshot.contains(CapabilityKind::Tool, "file:///a"));
        assert!(snapshot.contains(CapabilityKind::Resource, "file:///a"));
        assert!(!snapshot.contains(CapabilityKind::Prompt, "fetch"));
    }

    #[test]
    fn disabled_backend_starts_disabled() {
        let mut config = manifold_config::BackendConfig::default();
        config.enabled = false;
        let backend = Backend::new("off".into(), config);
        let state = backend.state.try_read().unwrap();
        assert_eq!(state.status, BackendStatus::Disabled);
    }
}
