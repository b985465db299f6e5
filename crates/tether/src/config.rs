//! Plugin Configuration
//!
//! In-memory form of the tether configuration file plus the helpers used to
//! find and load it. Hosts and installers only ever see a [`PluginConfig`];
//! where it came from is the caller's business.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable pointing directly at a configuration file
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Location of the configuration file relative to the home directory
pub const DEFAULT_CONFIG_PATH: &str = ".tether/config.toml";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Types
// ─────────────────────────────────────────────────────────────────────────────

/// `[meta]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub contributors: Vec<String>,
}

/// `[settings]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub debug: bool,
}

/// One `[plugins.<name>]` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(default)]
    pub author: String,

    /// Declared content digest of `exec_file`, lowercase hex
    #[serde(default, alias = "hash")]
    pub md5: String,

    /// Command used to start the plugin
    pub exec: String,

    #[serde(default)]
    pub exec_args: Vec<String>,

    /// File whose digest is verified before the plugin may run
    pub exec_file: PathBuf,

    /// Seconds to wait after spawning before the plugin is used
    #[serde(default)]
    pub exec_time: u64,

    /// `rest` or `grpc`
    pub protocol_type: String,

    /// Port the plugin should listen on, if the file pins one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// One `[hosts.<name>]` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// The whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub plugins: HashMap<String, PluginInfo>,
    #[serde(default)]
    pub hosts: HashMap<String, HostInfo>,
}

impl PluginConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| Error::ReadConfig {
                path: path.to_path_buf(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            plugins = config.plugins.len(),
            hosts = config.hosts.len(),
            "Loaded plugin configuration"
        );
        Ok(config)
    }

    /// Find the configuration file and load it
    pub async fn discover_and_load() -> Result<(PathBuf, Self)> {
        let path = discover(|key| std::env::var_os(key), dirs::home_dir())?;
        let config = Self::load(&path).await?;
        Ok((path, config))
    }

    /// Names of every configured host
    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Locate the configuration file.
///
/// The environment variable wins when set and pointing at an existing path;
/// otherwise the file under the home directory is used if present.
pub fn discover<F>(env: F, home: Option<PathBuf>) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<std::ffi::OsString>,
{
    if let Some(value) = env(CONFIG_ENV).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(value);
        if path.exists() {
            debug!(path = %path.display(), "Using config from environment");
            return Ok(path);
        }
        debug!(path = %path.display(), "Config from environment does not exist");
    }

    if let Some(home) = home {
        let path = home.join(DEFAULT_CONFIG_PATH);
        if path.exists() {
            debug!(path = %path.display(), "Using default config");
            return Ok(path);
        }
    }

    Err(Error::ConfigNotFound)
}
