//! Programmatic configuration builder for integration tests

use indexmap::IndexMap;
use manifold_config::{BackendConfig, BridgeSettings, Config, ConflictResolution};

/// Path to the compiled mock backend binary
pub const MOCK_BACKEND: &str = env!("CARGO_BIN_EXE_mock-backend");

/// A backend config running the mock with the given advertised tools
///
/// Timeouts and retry delays are tightened so failure paths resolve
/// within test deadlines.
pub fn mock_backend(name: &str, tools: &[&str]) -> BackendConfig {
    let mut config = BackendConfig {
        command: MOCK_BACKEND.to_string(),
        timeout: 5,
        retry_delay: 50,
        ..BackendConfig::default()
    };
    config.env.insert("MOCK_NAME".to_string(), name.to_string());
    config.env.insert("MOCK_TOOLS".to_string(), tools.join(","));
    config.health_check.restart_delay = 100;
    config
}

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    servers: IndexMap<String, BackendConfig>,
    bridge: BridgeSettings,
}

impl ConfigBuilder {
    /// Create a new builder with default bridge settings
    pub fn new() -> Self {
        Self {
            servers: IndexMap::new(),
            bridge: BridgeSettings::default(),
        }
    }

    /// Add a backend under the given name
    pub fn backend(mut self, name: &str, config: BackendConfig) -> Self {
        self.servers.insert(name.to_string(), config);
        self
    }

    pub fn conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.bridge.conflict_resolution = policy;
        self
    }

    pub fn default_namespace(mut self, enabled: bool) -> Self {
        self.bridge.default_namespace = enabled;
        self
    }

    pub fn failover(mut self, enabled: bool) -> Self {
        self.bridge.failover.enabled = enabled;
        self
    }

    pub fn build(self) -> Config {
        Config {
            mcp_servers: self.servers,
            bridge: self.bridge,
        }
    }
}
