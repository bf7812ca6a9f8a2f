//! Application configuration.
//!
//! Loaded in layers: built-in defaults, the TOML config file, then
//! `NBGATE__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::resolver::{LanguageSpec, default_languages};

pub const APP_NAME: &str = "nbgate";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub runtimes: RuntimesConfig,
    pub sync: SyncConfig,
    pub tunnel: TunnelConfig,
    pub bridge: BridgeConfig,
    pub cloud: CloudConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4410,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Overrides for the XDG data/state directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

/// Language backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
    /// Language definitions keyed by lowercase language name.
    pub languages: BTreeMap<String, LanguageSpec>,
    /// Directory containing bundled backend packages, one subdirectory per language.
    pub bundled_dir: Option<String>,
    /// Roots searched for co-located development checkouts.
    pub sibling_roots: Vec<String>,
    /// Host backends bind to and are probed on.
    pub host: String,
    /// Language used when a document declares none.
    pub default_language: String,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            bundled_dir: None,
            sibling_roots: Vec::new(),
            host: "127.0.0.1".to_string(),
            default_language: "python".to_string(),
            stop_grace_ms: 3_000,
        }
    }
}

/// Per-project document sync servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub binary: String,
    /// Arguments; `{port}`, `{project_dir}` and `{memory_mb}` are substituted.
    pub args: Vec<String>,
    /// Memory ceiling handed to the sync process.
    pub memory_limit_mb: u64,
    pub startup_timeout_secs: u64,
    pub host: String,
    pub stop_grace_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            binary: "nbgate-sync".to_string(),
            args: vec![
                "--port".to_string(),
                "{port}".to_string(),
                "--dir".to_string(),
                "{project_dir}".to_string(),
                "--max-memory-mb".to_string(),
                "{memory_mb}".to_string(),
            ],
            memory_limit_mb: 512,
            startup_timeout_secs: 10,
            host: "127.0.0.1".to_string(),
            stop_grace_ms: 3_000,
        }
    }
}

/// Relay tunnel (consumer side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// Relay WebSocket URL, e.g. `wss://relay.example.com/tunnel`.
    pub url: String,
    /// Room identity shared with the provider.
    pub user: String,
    pub token: Option<String>,
    pub rpc_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://127.0.0.1:8787/tunnel".to_string(),
            user: "local".to_string(),
            token: None,
            rpc_timeout_secs: 30,
            reconnect_delay_ms: 2_000,
        }
    }
}

/// Relay document bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Relay sync base URL; documents live under `{url}/{user}/{project}/{doc}`.
    pub url: String,
    pub user: String,
    pub reconnect_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/sync".to_string(),
            user: "local".to_string(),
            reconnect_delay_ms: 1_000,
        }
    }
}

/// Pre-provisioned remote runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Languages routed to the remote runtime instead of local processes.
    pub routed_languages: Vec<String>,
    pub host: String,
    pub port: u16,
    pub capabilities_path: String,
    pub probe_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            routed_languages: vec!["python".to_string()],
            host: "127.0.0.1".to_string(),
            port: 8765,
            capabilities_path: "/api/capabilities".to_string(),
            probe_timeout_ms: 3_000,
        }
    }
}

impl AppConfig {
    /// Load from `config_file` (if present) and the environment.
    pub fn load(config_file: &Path) -> Result<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
            .build()
            .with_context(|| format!("reading config {}", config_file.display()))?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(config)
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }

        let toml = toml::to_string_pretty(&AppConfig::default())
            .context("serializing default config to TOML")?;
        let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
        body.push_str(&toml);
        std::fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
    }
}

/// Environment prefix derived from the app name.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Expand `~` and environment variables in a path.
pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow::anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow::anyhow!("unable to determine data directory"))
}

pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow::anyhow!("unable to determine state directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        AppConfig::write_default(&path).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for nbgate"));

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4410);
        assert_eq!(loaded.tunnel.rpc_timeout_secs, 30);
        assert_eq!(loaded.cloud.routed_languages, vec!["python".to_string()]);
        assert_eq!(loaded.runtimes.languages["julia"].startup_timeout_secs, 120);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sync]\nmemory_limit_mb = 1024\n").unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.sync.memory_limit_mb, 1024);
        assert_eq!(loaded.sync.binary, "nbgate-sync");
        assert!(loaded.runtimes.languages.contains_key("python"));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.server.host, "127.0.0.1");
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "NBGATE");
    }
}
