use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths;

/// Daemon configuration, loaded from `<data_dir>/config.toml`.
///
/// Every field has a default so a missing file yields a working localhost
/// setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Container engine binary.
    pub engine_binary: String,

    /// Command line that starts the coding agent inside a drone.
    pub agent_command: Vec<String>,

    /// HTTP bind address.
    pub bind_addr: String,

    /// HTTP server port.
    pub http_port: u16,

    /// Preferred internal port published by new drones.
    pub container_port: u16,

    /// GitHub API token; `GITHUB_TOKEN` wins when set.
    pub github_token: Option<String>,

    /// Base URL of the hosting service API.
    pub github_api_base: String,

    /// Endpoint used to draft drone names from the seed prompt.
    pub naming_endpoint: Option<String>,

    /// API key for the naming endpoint; `DRONEHUB_NAMING_KEY` wins when set.
    pub naming_api_key: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            engine_binary: "dvm".to_owned(),
            agent_command: vec!["claude".to_owned()],
            bind_addr: "127.0.0.1".to_owned(),
            http_port: 3080,
            container_port: 3000,
            github_token: None,
            github_api_base: "https://api.github.com".to_owned(),
            naming_endpoint: None,
            naming_api_key: None,
        }
    }
}

impl HubConfig {
    /// Load configuration from the default location, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// The GitHub token with the environment taking precedence.
    #[must_use]
    pub fn github_token(&self) -> Option<String> {
        std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.github_token.clone())
    }

    /// The naming-endpoint key with the environment taking precedence.
    #[must_use]
    pub fn naming_api_key(&self) -> Option<String> {
        std::env::var("DRONEHUB_NAMING_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.naming_api_key.clone())
    }

    /// Resolved data directory (kept here so callers don't reach into
    /// `paths` for the common case).
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        paths::data_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            HubConfig::load_from(&dir.path().join("config.toml")).expect("load defaults");
        assert_eq!(config.engine_binary, "dvm");
        assert_eq!(config.bind_addr, "127.0.0.1");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "http_port = 9000\nengine_binary = \"dvm-dev\"\n")
            .expect("write config");

        let config = HubConfig::load_from(&path).expect("load config");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.engine_binary, "dvm-dev");
        assert_eq!(config.agent_command, vec!["claude".to_owned()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "no_such_key = 1\n").expect("write config");

        assert!(HubConfig::load_from(&path).is_err());
    }
}
