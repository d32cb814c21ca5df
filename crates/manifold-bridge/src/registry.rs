//! The unified capability catalog
//!
//! Rebuilt from the ready backends' snapshots on every readiness or
//! capability change. Rebuilds are serialized on a single task and
//! coalesce queued triggers; publication swaps an immutable snapshot
//! behind an `Arc`, so readers never observe a partial catalog.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use manifold_config::{BridgeSettings, ConflictResolution};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::{Backend, CapabilityKind, CatalogSnapshot, DeclaredKinds};

/// How long the first rebuild waits for the initial connection round
const STARTUP_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Triggers for a catalog rebuild
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A backend entered or left `Ready`
    Readiness { backend: String, ready: bool },
    /// A ready backend's snapshot was replaced
    CapabilityChanged { backend: String },
}

/// One published capability: owning backend, native identifier, and the
/// descriptor exactly as the backend delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub backend: String,
    pub native_id: String,
    pub descriptor: Value,
}

/// The namespaced view over all ready backends
///
/// Every public identifier maps to exactly one `(backend, native-id)`
/// pair. Map order is the deterministic merge order, so discovery
/// listings are stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedCatalog {
    pub tools: IndexMap<String, CatalogEntry>,
    pub resources: IndexMap<String, CatalogEntry>,
    pub prompts: IndexMap<String, CatalogEntry>,
}

impl UnifiedCatalog {
    pub fn kind(&self, kind: CapabilityKind) -> &IndexMap<String, CatalogEntry> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }
}

/// Everything a rebuild needs to know about one ready backend
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub name: String,
    pub priority: u32,
    pub ready_seq: u64,
    pub tool_namespace: Option<String>,
    pub resource_namespace: Option<String>,
    pub prompt_namespace: Option<String>,
    pub snapshot: CatalogSnapshot,
}

impl SnapshotInput {
    fn namespace(&self, kind: CapabilityKind, default_namespace: bool) -> Option<&str> {
        let explicit = match kind {
            CapabilityKind::Tool => self.tool_namespace.as_deref(),
            CapabilityKind::Resource => self.resource_namespace.as_deref(),
            CapabilityKind::Prompt => self.prompt_namespace.as_deref(),
        };
        explicit.or_else(|| default_namespace.then_some(self.name.as_str()))
    }
}

/// Form the public identifier for a native one
///
/// Tools and prompts join with `.`; resource URIs take the prefix as a
/// leading scheme segment joined with `+`, so `file:///a` under namespace
/// `fs` becomes `fs+file:///a`.
pub fn public_id(kind: CapabilityKind, namespace: Option<&str>, native_id: &str) -> String {
    match (namespace, kind) {
        (None, _) => native_id.to_string(),
        (Some(ns), CapabilityKind::Resource) => format!("{ns}+{native_id}"),
        (Some(ns), _) => format!("{ns}.{native_id}"),
    }
}

/// A duplicate public identifier under the `error` policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogConflict {
    pub id: String,
}

/// Compute the unified catalog from ready-backend snapshots
///
/// Pure: equal inputs yield equal catalogs. Merge order is the
/// policy-determined backend order, so listings are deterministic.
pub fn compute_catalog(
    inputs: &[SnapshotInput],
    settings: &BridgeSettings,
) -> Result<UnifiedCatalog, CatalogConflict> {
    let mut ordered: Vec<&SnapshotInput> = inputs.iter().collect();
    match settings.conflict_resolution {
        ConflictResolution::Priority => {
            ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        }
        ConflictResolution::First => ordered.sort_by_key(|input| input.ready_seq),
        // Config order as given
        ConflictResolution::Namespace | ConflictResolution::Error => {}
    }

    let mut catalog = UnifiedCatalog::default();
    for (kind, enabled) in [
        (CapabilityKind::Tool, settings.aggregation.tools),
        (CapabilityKind::Resource, settings.aggregation.resources),
        (CapabilityKind::Prompt, settings.aggregation.prompts),
    ] {
        if !enabled {
            continue;
        }
        let merged = merge_kind(&ordered, kind, settings)?;
        match kind {
            CapabilityKind::Tool => catalog.tools = merged,
            CapabilityKind::Resource => catalog.resources = merged,
            CapabilityKind::Prompt => catalog.prompts = merged,
        }
    }
    Ok(catalog)
}

fn merge_kind(
    ordered: &[&SnapshotInput],
    kind: CapabilityKind,
    settings: &BridgeSettings,
) -> Result<IndexMap<String, CatalogEntry>, CatalogConflict> {
    let mut map: IndexMap<String, CatalogEntry> = IndexMap::new();

    for input in ordered {
        let namespace = input.namespace(kind, settings.default_namespace);
        for descriptor in input.snapshot.entries(kind) {
            let Some(native_id) = descriptor.get(kind.id_field()).and_then(Value::as_str) else {
                tracing::warn!(
                    backend = %input.name,
                    field = kind.id_field(),
                    "skipping catalog entry without identifier"
                );
                continue;
            };
            let public = public_id(kind, namespace, native_id);
            let entry = CatalogEntry {
                backend: input.name.clone(),
                native_id: native_id.to_string(),
                descriptor: descriptor.clone(),
            };

            if !map.contains_key(&public) {
                map.insert(public, entry);
                continue;
            }

            match settings.conflict_resolution {
                ConflictResolution::Error => return Err(CatalogConflict { id: public }),
                // Winner already holds the slot; the later arrival drops
                ConflictResolution::Priority | ConflictResolution::First => {
                    tracing::debug!(
                        backend = %input.name,
                        id = %public,
                        "conflict resolved against this backend, entry dropped"
                    );
                }
                ConflictResolution::Namespace => {
                    // Re-prefix both colliding entries with backend names
                    let existing = map
                        .shift_remove(&public)
                        .unwrap_or_else(|| unreachable!("checked contains_key above"));
                    let existing_key =
                        public_id(kind, Some(existing.backend.as_str()), &existing.native_id);
                    let entry_key = public_id(kind, Some(input.name.as_str()), native_id);
                    insert_or_drop(&mut map, existing_key, existing);
                    insert_or_drop(&mut map, entry_key, entry);
                }
            }
        }
    }

    Ok(map)
}

fn insert_or_drop(map: &mut IndexMap<String, CatalogEntry>, key: String, entry: CatalogEntry) {
    if let Some(occupant) = map.get(&key) {
        tracing::warn!(
            id = %key,
            winner = %occupant.backend,
            dropped = %entry.backend,
            "identifier still conflicts after backend-name prefixing, dropping entry"
        );
        return;
    }
    map.insert(key, entry);
}

/// Owns the published catalog and serializes rebuilds
pub struct Registry {
    backends: Vec<Arc<Backend>>,
    settings: Arc<BridgeSettings>,
    published: RwLock<Arc<UnifiedCatalog>>,
    conflicted: AtomicBool,
}

impl Registry {
    pub fn new(backends: Vec<Arc<Backend>>, settings: Arc<BridgeSettings>) -> Self {
        Self {
            backends,
            settings,
            published: RwLock::new(Arc::new(UnifiedCatalog::default())),
            conflicted: AtomicBool::new(false),
        }
    }

    /// Spawn the rebuild task
    ///
    /// The first rebuild waits for the initial connection round to settle
    /// so startup publishes one coherent catalog instead of a flurry of
    /// partial ones. Afterwards, every event triggers a rebuild; queued
    /// events coalesce into a single pass.
    pub fn spawn(
        registry: Arc<Self>,
        mut events: mpsc::Receiver<RegistryEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            registry.await_initial_settle(&mut events, &shutdown).await;
            registry.rebuild().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Coalesce whatever else is queued
                        while events.try_recv().is_ok() {}
                        registry.rebuild().await;
                    }
                }
            }
        })
    }

    async fn await_initial_settle(
        &self,
        events: &mut mpsc::Receiver<RegistryEvent>,
        shutdown: &CancellationToken,
    ) {
        let mut awaiting: HashSet<String> = self
            .backends
            .iter()
            .filter(|backend| backend.config.enabled)
            .map(|backend| backend.name.clone())
            .collect();

        let deadline = tokio::time::sleep(STARTUP_SETTLE_TIMEOUT);
        tokio::pin!(deadline);

        while !awaiting.is_empty() {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = &mut deadline => {
                    tracing::warn!(
                        pending = awaiting.len(),
                        "some backends are still connecting, publishing catalog without them"
                    );
                    return;
                }
                event = events.recv() => match event {
                    Some(RegistryEvent::Readiness { backend, .. }) => {
                        awaiting.remove(&backend);
                    }
                    Some(RegistryEvent::CapabilityChanged { .. }) => {}
                    None => return,
                }
            }
        }
    }

    /// Recompute and atomically publish the catalog
    ///
    /// Under the `error` policy a conflict leaves the previous catalog in
    /// effect.
    pub async fn rebuild(&self) {
        let mut inputs = Vec::new();
        for backend in &self.backends {
            let state = backend.state.read().await;
            if state.status.is_ready() {
                inputs.push(SnapshotInput {
                    name: backend.name.clone(),
                    priority: backend.config.priority,
                    ready_seq: state.ready_seq.unwrap_or(u64::MAX),
                    tool_namespace: backend.config.tool_namespace.clone(),
                    resource_namespace: backend.config.resource_namespace.clone(),
                    prompt_namespace: backend.config.prompt_namespace.clone(),
                    snapshot: state.snapshot.clone(),
                });
            }
        }

        match compute_catalog(&inputs, self.settings.as_ref()) {
            Ok(catalog) => {
                tracing::debug!(
                    backends = inputs.len(),
                    tools = catalog.tools.len(),
                    resources = catalog.resources.len(),
                    prompts = catalog.prompts.len(),
                    "published rebuilt catalog"
                );
                self.conflicted.store(false, Ordering::Relaxed);
                *self
                    .published
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
            }
            Err(conflict) => {
                self.conflicted.store(true, Ordering::Relaxed);
                tracing::warn!(
                    id = %conflict.id,
                    "catalog conflict under 'error' policy, retaining previous catalog"
                );
            }
        }
    }

    /// The current published catalog; the reference stays coherent for
    /// the caller's lifetime regardless of concurrent rebuilds
    pub fn catalog(&self) -> Arc<UnifiedCatalog> {
        Arc::clone(
            &self
                .published
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Whether the last rebuild was refused under the `error` policy
    pub fn is_conflicted(&self) -> bool {
        self.conflicted.load(Ordering::Relaxed)
    }

    /// Resolve a public identifier to its catalog entry
    pub fn resolve(&self, kind: CapabilityKind, public: &str) -> Option<CatalogEntry> {
        self.catalog().kind(kind).get(public).cloned()
    }

    /// Discovery listing with identifiers rewritten to public form;
    /// descriptors are otherwise verbatim
    pub fn list(&self, kind: CapabilityKind) -> Vec<Value> {
        self.catalog()
            .kind(kind)
            .iter()
            .map(|(public, entry)| {
                let mut descriptor = entry.descriptor.clone();
                if let Some(object) = descriptor.as_object_mut() {
                    object.insert(kind.id_field().to_string(), Value::String(public.clone()));
                }
                descriptor
            })
            .collect()
    }

    /// Union of capability kinds declared by ready backends, for the
    /// bridge's own initialize response
    pub async fn declared_kinds(&self) -> DeclaredKinds {
        let mut kinds = DeclaredKinds::default();
        for backend in &self.backends {
            let state = backend.state.read().await;
            if state.status.is_ready() {
                kinds.tools |= state.snapshot.kinds.tools && self.settings.aggregation.tools;
                kinds.resources |=
                    state.snapshot.kinds.resources && self.settings.aggregation.resources;
                kinds.prompts |= state.snapshot.kinds.prompts && self.settings.aggregation.prompts;
            }
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": format!("{name} tool"), "inputSchema": {"type": "object"}})
    }

    fn input(name: &str, priority: u32, ready_seq: u64, tools: &[&str]) -> SnapshotInput {
        SnapshotInput {
            name: name.to_string(),
            priority,
            ready_seq,
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            snapshot: CatalogSnapshot {
                tools: tools.iter().map(|t| tool(t)).collect(),
                ..CatalogSnapshot::default()
            },
        }
    }

    fn settings(policy: ConflictResolution, default_namespace: bool) -> BridgeSettings {
        BridgeSettings {
            conflict_resolution: policy,
            default_namespace,
            ..BridgeSettings::default()
        }
    }

    #[test]
    fn default_namespacing_keeps_duplicates_apart() {
        let inputs = [input("a", 100, 0, &["fetch"]), input("b", 100, 1, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Namespace, true)).unwrap();
        let names: Vec<&str> = catalog.tools.keys().map(String::as_str).collect();
        assert_eq!(names, ["a.fetch", "b.fetch"]);
        assert_eq!(catalog.tools["a.fetch"].native_id, "fetch");
        assert_eq!(catalog.tools["a.fetch"].backend, "a");
    }

    #[test]
    fn namespace_policy_reprefixes_colliding_bare_names() {
        let inputs = [input("a", 100, 0, &["fetch"]), input("b", 100, 1, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Namespace, false)).unwrap();
        let names: Vec<&str> = catalog.tools.keys().map(String::as_str).collect();
        assert_eq!(names, ["a.fetch", "b.fetch"]);
    }

    #[test]
    fn priority_policy_lowest_wins() {
        let inputs = [input("b", 100, 0, &["fetch"]), input("a", 50, 1, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Priority, false)).unwrap();
        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(catalog.tools["fetch"].backend, "a");
    }

    #[test]
    fn priority_ties_break_on_name() {
        let inputs = [input("zeta", 50, 0, &["fetch"]), input("alpha", 50, 1, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Priority, false)).unwrap();
        assert_eq!(catalog.tools["fetch"].backend, "alpha");
    }

    #[test]
    fn first_policy_follows_readiness_order() {
        let inputs = [input("a", 50, 9, &["fetch"]), input("b", 100, 2, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::First, false)).unwrap();
        assert_eq!(catalog.tools["fetch"].backend, "b");
    }

    #[test]
    fn error_policy_refuses_conflicts() {
        let inputs = [input("a", 100, 0, &["fetch"]), input("b", 100, 1, &["fetch"])];
        let conflict =
            compute_catalog(&inputs, &settings(ConflictResolution::Error, false)).unwrap_err();
        assert_eq!(conflict.id, "fetch");
    }

    #[test]
    fn error_policy_passes_when_namespaced_apart() {
        let inputs = [input("a", 100, 0, &["fetch"]), input("b", 100, 1, &["fetch"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Error, true)).unwrap();
        assert_eq!(catalog.tools.len(), 2);
    }

    #[test]
    fn explicit_namespace_beats_default() {
        let mut a = input("a", 100, 0, &["fetch"]);
        a.tool_namespace = Some("web".to_string());
        let catalog =
            compute_catalog(&[a], &settings(ConflictResolution::Namespace, true)).unwrap();
        assert_eq!(catalog.tools.keys().next().map(String::as_str), Some("web.fetch"));
    }

    #[test]
    fn resource_uris_take_plus_separator() {
        let mut a = input("a", 100, 0, &[]);
        a.snapshot.resources = vec![json!({"uri": "file:///data/x", "name": "x"})];
        let catalog =
            compute_catalog(&[a], &settings(ConflictResolution::Namespace, true)).unwrap();
        let entry = &catalog.resources["a+file:///data/x"];
        assert_eq!(entry.native_id, "file:///data/x");
    }

    #[test]
    fn rebuild_is_pure() {
        let inputs = [
            input("a", 50, 0, &["fetch", "search"]),
            input("b", 100, 1, &["fetch"]),
        ];
        for policy in [
            ConflictResolution::Priority,
            ConflictResolution::Namespace,
            ConflictResolution::First,
        ] {
            let once = compute_catalog(&inputs, &settings(policy, true)).unwrap();
            let twice = compute_catalog(&inputs, &settings(policy, true)).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn public_id_round_trips_through_the_catalog() {
        let inputs = [input("a", 100, 0, &["fetch", "search"])];
        let catalog =
            compute_catalog(&inputs, &settings(ConflictResolution::Namespace, true)).unwrap();
        for (public, entry) in &catalog.tools {
            let rebuilt = public_id(
                CapabilityKind::Tool,
                Some(entry.backend.as_str()),
                &entry.native_id,
            );
            assert_eq!(&rebuilt, public);
        }
    }

    #[test]
    fn duplicate_native_id_across_kinds_stays_separate() {
        let mut a = input("a", 100, 0, &["fetch"]);
        a.snapshot.prompts = vec![json!({"name": "fetch", "description": "prompt"})];
        let catalog =
            compute_catalog(&[a], &settings(ConflictResolution::Error, true)).unwrap();
        assert!(catalog.tools.contains_key("a.fetch"));
        assert!(catalog.prompts.contains_key("a.fetch"));
    }

    #[test]
    fn empty_inputs_yield_empty_catalog() {
        let catalog =
            compute_catalog(&[], &settings(ConflictResolution::Namespace, true)).unwrap();
        assert!(catalog.tools.is_empty());
        assert!(catalog.resources.is_empty());
        assert!(catalog.prompts.is_empty());
    }

    #[test]
    fn disabled_aggregation_excludes_kind() {
        let mut settings = settings(ConflictResolution::Namespace, true);
        settings.aggregation.tools = false;
        let inputs = [input("a", 100, 0, &["fetch"])];
        let catalog = compute_catalog(&inputs, &settings).unwrap();
        assert!(catalog.tools.is_empty());
    }

    #[test]
    fn entry_without_identifier_is_skipped() {
        let mut a = input("a", 100, 0, &[]);
        a.snapshot.tools = vec![json!({"description": "nameless"}), tool("fetch")];
        let catalog =
            compute_catalog(&[a], &settings(ConflictResolution::Namespace, true)).unwrap();
        assert_eq!(catalog.tools.len(), 1);
    }
}
