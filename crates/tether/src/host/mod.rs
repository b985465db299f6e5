//! Host Installer
//!
//! Turns the configuration into the set of plugins one host may run:
//! 1. [`Installer::resolve`] picks the host's authorized plugins
//! 2. [`Installer::install`] keeps those whose executable exists and whose
//!    digest matches the declared hash
//!
//! Plugins failing a check are excluded and logged; they never fail the
//! installation on their own.

mod flow;
mod identity;

pub use flow::{LocatedPlugin, PluginCandidate, VerifiedPlugin};
pub use identity::{DigestChecker, IdentityChecker, Md5Checker, Sha256Checker};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{PluginConfig, PluginInfo};
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Installed plugin entry; immutable once installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMeta {
    pub exec_path: String,
    pub exec_args: Vec<String>,
    pub exec_file: PathBuf,
    /// Grace period after spawning
    pub exec_time: Duration,
    /// Declared digest of `exec_file`
    pub hash: String,
    /// Declared protocol, validated when a caller is built
    pub protocol_type: String,
}

impl From<&PluginInfo> for PluginMeta {
    fn from(info: &PluginInfo) -> Self {
        Self {
            exec_path: info.exec.clone(),
            exec_args: info.exec_args.clone(),
            exec_file: info.exec_file.clone(),
            exec_time: Duration::from_secs(info.exec_time),
            hash: info.md5.clone(),
            protocol_type: info.protocol_type.clone(),
        }
    }
}

/// Plugin name → installed entry
pub type Plugins = BTreeMap<String, Arc<PluginMeta>>;

// ─────────────────────────────────────────────────────────────────────────────
// Installer
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves and verifies the plugins of one host
#[derive(Clone)]
pub struct Installer {
    hostname: String,
    config: Option<Arc<PluginConfig>>,
    checker: Arc<dyn IdentityChecker>,
}

impl Installer {
    pub fn new(
        hostname: impl Into<String>,
        config: Option<Arc<PluginConfig>>,
        checker: Arc<dyn IdentityChecker>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            config,
            checker,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Authorized plugins of the host.
    ///
    /// `None` without a configuration; empty when the host is unknown or
    /// lists nothing.
    pub fn resolve(&self) -> Option<Plugins> {
        let config = self.config.as_ref()?;
        let plugins: Plugins = flow::authorized(&self.hostname, config)
            .into_iter()
            .map(|c| (c.name, c.meta))
            .collect();

        debug!(host = %self.hostname, count = plugins.len(), "Resolved authorized plugins");
        Some(plugins)
    }

    /// Verify resolved plugins, keeping the survivors
    pub fn install(&self, plugins: Option<Plugins>) -> Result<Plugins> {
        let plugins = plugins.ok_or(Error::EmptyPlugins)?;

        let installed: Plugins = plugins
            .into_iter()
            .map(|(name, meta)| PluginCandidate { name, meta })
            .filter_map(PluginCandidate::locate)
            .filter_map(|located| located.verify(self.checker.as_ref()))
            .map(VerifiedPlugin::into_parts)
            .collect();

        if installed.is_empty() {
            return Err(Error::NoPluginsAvailable);
        }

        info!(
            host = %self.hostname,
            plugins = ?installed.keys().collect::<Vec<_>>(),
            "Installed plugins"
        );
        Ok(installed)
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("hostname", &self.hostname)
            .field("configured", &self.config.is_some())
            .finish_non_exhaustive()
    }
}
