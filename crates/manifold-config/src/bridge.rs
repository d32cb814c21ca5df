use serde::Deserialize;

/// Bridge-wide behavior: namespacing, conflict resolution, failover
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BridgeSettings {
    /// Host the SSE server binds to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the SSE server binds to
    #[serde(default = "default_port")]
    pub port: u16,
    /// How identical public identifiers from different backends resolve
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    /// Prefix capabilities with the backend name when no explicit
    /// namespace is configured
    #[serde(default = "default_true")]
    pub default_namespace: bool,
    /// Per-kind aggregation toggles
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Rerouting of requests whose owning backend is not ready
    #[serde(default)]
    pub failover: FailoverConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            conflict_resolution: ConflictResolution::default(),
            default_namespace: default_true(),
            aggregation: AggregationConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

/// Conflict-resolution policies for duplicate public identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Lowest numeric backend priority wins; ties break on backend name
    Priority,
    /// Force backend-name prefixes onto the colliding entries
    #[default]
    Namespace,
    /// The first backend to become ready keeps the identifier
    First,
    /// Refuse to publish; the previous catalog stays in effect
    Error,
}

/// Which capability kinds the bridge aggregates
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub tools: bool,
    #[serde(default = "default_true")]
    pub resources: bool,
    #[serde(default = "default_true")]
    pub prompts: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

/// Failover behavior when a backend is unavailable at dispatch time
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe failures tolerated bridge-wide before failing a backend,
    /// when the backend does not override it
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Delay in milliseconds before retrying a backend whose restart
    /// budget is exhausted
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            recovery_interval: default_recovery_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
#[allow(clippy::missing_const_for_fn)]
fn default_port() -> u16 {
    8080
}
#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
#[allow(clippy::missing_const_for_fn)]
fn default_max_failures() -> u32 {
    3
}
#[allow(clippy::missing_const_for_fn)]
fn default_recovery_interval() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_favor_namespacing() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.conflict_resolution, ConflictResolution::Namespace);
        assert!(settings.default_namespace);
        assert!(settings.aggregation.tools);
        assert!(settings.failover.enabled);
    }

    #[test]
    fn policies_parse_lowercase() {
        for (text, expected) in [
            ("priority", ConflictResolution::Priority),
            ("namespace", ConflictResolution::Namespace),
            ("first", ConflictResolution::First),
            ("error", ConflictResolution::Error),
        ] {
            let settings: BridgeSettings =
                serde_json::from_str(&format!(r#"{{"conflictResolution": "{text}"}}"#)).unwrap();
            assert_eq!(settings.conflict_resolution, expected);
        }
    }
}
