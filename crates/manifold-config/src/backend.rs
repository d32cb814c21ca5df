use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

/// Configuration for a single backend MCP server
///
/// Backends are spawned as child subprocesses speaking line-delimited
/// JSON-RPC on stdio. All fields except `command` have defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BackendConfig {
    /// Command to execute
    pub command: String,
    /// Command arguments; `${VAR}` / `${VAR:default}` are expanded at spawn
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the child; values are expanded at spawn
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Disabled backends are never spawned
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Request/response deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Reconnect attempt budget before the backend has ever been ready
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base reconnect delay in milliseconds; doubles per attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Explicit namespace prefix for tools
    #[serde(default)]
    pub tool_namespace: Option<String>,
    /// Explicit namespace prefix for resource URIs
    #[serde(default)]
    pub resource_namespace: Option<String>,
    /// Explicit namespace prefix for prompts
    #[serde(default)]
    pub prompt_namespace: Option<String>,
    /// Conflict-resolution priority; lower wins
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Free-form labels, echoed in the status report
    #[serde(default)]
    pub tags: Vec<String>,
    /// Liveness probing and restart policy
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl BackendConfig {
    /// Deadline applied to requests forwarded to this backend
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: IndexMap::new(),
            enabled: default_enabled(),
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            priority: default_priority(),
            tags: Vec::new(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Liveness probing and automatic restart policy for one backend
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Probe interval in milliseconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Per-probe deadline in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
    /// Which operation the probe issues
    #[serde(default)]
    pub operation: ProbeOperation,
    /// Tool to invoke for the `call_tool` probe
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Arguments for the `call_tool` probe
    #[serde(default)]
    pub tool_arguments: Option<Value>,
    /// URI for the `read_resource` probe
    #[serde(default)]
    pub resource_uri: Option<String>,
    /// Prompt for the `get_prompt` probe
    #[serde(default)]
    pub prompt_name: Option<String>,
    /// Arguments for the `get_prompt` probe
    #[serde(default)]
    pub prompt_arguments: Option<Value>,
    /// URL for the `ping` probe
    #[serde(default)]
    pub url: Option<String>,
    /// Expected HTTP status for the `ping` probe
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    /// Substring the `ping` probe body must contain
    #[serde(default)]
    pub expected_content: Option<String>,
    /// Restart the backend automatically after it fails
    #[serde(default = "default_enabled")]
    pub auto_restart: bool,
    /// Delay before the first restart attempt, in milliseconds
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
    /// Restart attempt budget once the backend has been ready
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Probe failures tolerated before the backend is marked failed
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_interval(),
            timeout: default_probe_timeout(),
            operation: ProbeOperation::default(),
            tool_name: None,
            tool_arguments: None,
            resource_uri: None,
            prompt_name: None,
            prompt_arguments: None,
            url: None,
            expected_status: default_expected_status(),
            expected_content: None,
            auto_restart: default_enabled(),
            restart_delay: default_restart_delay(),
            max_restart_attempts: default_max_restart_attempts(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Liveness probe operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOperation {
    #[default]
    ListTools,
    ListResources,
    ListPrompts,
    CallTool,
    ReadResource,
    GetPrompt,
    /// HTTP GET against `url`, checked for `expected_status` and
    /// `expected_content`
    Ping,
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}
#[allow(clippy::missing_const_for_fn)]
fn default_timeout() -> u64 {
    30
}
#[allow(clippy::missing_const_for_fn)]
fn default_retry_attempts() -> u32 {
    3
}
#[allow(clippy::missing_const_for_fn)]
fn default_retry_delay() -> u64 {
    1_000
}
#[allow(clippy::missing_const_for_fn)]
fn default_priority() -> u32 {
    100
}
#[allow(clippy::missing_const_for_fn)]
fn default_interval() -> u64 {
    30_000
}
#[allow(clippy::missing_const_for_fn)]
fn default_probe_timeout() -> u64 {
    5_000
}
#[allow(clippy::missing_const_for_fn)]
fn default_expected_status() -> u16 {
    200
}
#[allow(clippy::missing_const_for_fn)]
fn default_restart_delay() -> u64 {
    5_000
}
#[allow(clippy::missing_const_for_fn)]
fn default_max_restart_attempts() -> u32 {
    5
}
#[allow(clippy::missing_const_for_fn)]
fn default_max_consecutive_failures() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_backend_gets_defaults() {
        let config: BackendConfig = serde_json::from_str(r#"{"command": "echo"}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.timeout, 30);
        assert_eq!(config.priority, 100);
        assert_eq!(config.health_check.operation, ProbeOperation::ListTools);
        assert!(config.health_check.auto_restart);
    }

    #[test]
    fn probe_operation_parses_snake_case() {
        let config: HealthCheckConfig =
            serde_json::from_str(r#"{"operation": "call_tool", "toolName": "noop"}"#).unwrap();
        assert_eq!(config.operation, ProbeOperation::CallTool);
        assert_eq!(config.tool_name.as_deref(), Some("noop"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = serde_json::from_str::<BackendConfig>(r#"{"command": "x", "comand": "y"}"#);
        assert!(err.is_err());
    }
}
