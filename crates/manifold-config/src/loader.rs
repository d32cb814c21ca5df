use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::Config;

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("must be valid regex"))
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Reads the file, deserializes, then validates the result.
    /// `${VAR}` placeholders in backend args and env values are left
    /// intact here; they expand at spawn time.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, JSON parsing fails,
    /// or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// An empty backend set is valid: the bridge then answers discovery
    /// with empty catalogs.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend name or field is invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_backends()?;
        self.validate_listen_address()?;
        Ok(())
    }

    fn validate_backends(&self) -> anyhow::Result<()> {
        for (name, backend) in &self.mcp_servers {
            if !name_re().is_match(name) {
                anyhow::bail!(
                    "backend name '{name}' is invalid: only letters, digits, '_' and '-' are allowed"
                );
            }
            if backend.command.is_empty() {
                anyhow::bail!("backend '{name}' has no command");
            }
            if backend.timeout == 0 {
                anyhow::bail!("backend '{name}' timeout must be greater than 0");
            }
            let hc = &backend.health_check;
            if hc.enabled && hc.interval == 0 {
                anyhow::bail!("backend '{name}' health check interval must be greater than 0");
            }
            for namespace in [
                &backend.tool_namespace,
                &backend.resource_namespace,
                &backend.prompt_namespace,
            ]
            .into_iter()
            .flatten()
            {
                if !name_re().is_match(namespace) {
                    anyhow::bail!("backend '{name}' namespace '{namespace}' is invalid");
                }
            }
        }
        Ok(())
    }

    fn validate_listen_address(&self) -> anyhow::Result<()> {
        self.bridge
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| anyhow::anyhow!("bridge host '{}' is invalid: {e}", self.bridge.host))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, ConflictResolution};

    fn parse(raw: &str) -> anyhow::Result<Config> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"{
                "mcpServers": {
                    "github": {
                        "command": "npx",
                        "args": ["-y", "@modelcontextprotocol/server-github"],
                        "env": {"GITHUB_TOKEN": "${GITHUB_TOKEN}"},
                        "priority": 50,
                        "tags": ["vcs"],
                        "healthCheck": {"interval": 10000, "operation": "list_tools"}
                    }
                },
                "bridge": {
                    "conflictResolution": "priority",
                    "defaultNamespace": false,
                    "failover": {"enabled": true, "maxFailures": 5, "recoveryInterval": 1000}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.mcp_servers.len(), 1);
        let github = &config.mcp_servers["github"];
        assert_eq!(github.priority, 50);
        assert_eq!(github.env["GITHUB_TOKEN"], "${GITHUB_TOKEN}");
        assert_eq!(
            config.bridge.conflict_resolution,
            ConflictResolution::Priority
        );
        assert!(!config.bridge.default_namespace);
    }

    #[test]
    fn empty_backend_set_is_valid() {
        let config = parse(r#"{"mcpServers": {}}"#).unwrap();
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn dotted_backend_name_rejected() {
        let err = parse(r#"{"mcpServers": {"a.b": {"command": "echo"}}}"#).unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn missing_command_rejected() {
        let err = parse(r#"{"mcpServers": {"a": {"command": ""}}}"#).unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn bad_host_rejected() {
        let err =
            parse(r#"{"mcpServers": {}, "bridge": {"host": "not-an-ip"}}"#).unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn config_order_is_preserved() {
        let config = parse(
            r#"{"mcpServers": {
                "zeta": {"command": "echo"},
                "alpha": {"command": "echo"}
            }}"#,
        )
        .unwrap();
        let names: Vec<&str> = config.mcp_servers.keys().map(String::as_str).collect();
        assert_eq!(names, ["zeta", "alpha"]);
    }
}
