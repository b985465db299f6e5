//! Installation stages.
//!
//! A plugin moves through three typed stages:
//! [`PluginCandidate`] → [`LocatedPlugin`] → [`VerifiedPlugin`].
//! A stage can only be reached from the previous one, so the hash is never
//! computed for a file that was not found.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{IdentityChecker, PluginMeta};
use crate::config::PluginConfig;

/// A plugin authorized for a host, not yet checked
#[derive(Debug, Clone)]
pub struct PluginCandidate {
    pub name: String,
    pub meta: Arc<PluginMeta>,
}

/// A candidate whose executable file exists
#[derive(Debug, Clone)]
pub struct LocatedPlugin(PluginCandidate);

/// A located plugin whose file digest matches the declared hash
#[derive(Debug, Clone)]
pub struct VerifiedPlugin(PluginCandidate);

impl VerifiedPlugin {
    pub fn into_parts(self) -> (String, Arc<PluginMeta>) {
        (self.0.name, self.0.meta)
    }
}

/// Plugins the host is authorized to use, in listing order.
///
/// Names missing from `[plugins]` are dropped.
pub fn authorized(hostname: &str, config: &PluginConfig) -> Vec<PluginCandidate> {
    let Some(host) = config.hosts.get(hostname) else {
        debug!(host = %hostname, "Host not present in configuration");
        return Vec::new();
    };

    host.plugins
        .iter()
        .filter_map(|name| match config.plugins.get(name) {
            Some(info) => Some(PluginCandidate {
                name: name.clone(),
                meta: Arc::new(PluginMeta::from(info)),
            }),
            None => {
                debug!(host = %hostname, plugin = %name, "Skipping unknown plugin");
                None
            }
        })
        .collect()
}

impl PluginCandidate {
    pub fn locate(self) -> Option<LocatedPlugin> {
        match std::fs::metadata(&self.meta.exec_file) {
            Ok(_) => Some(LocatedPlugin(self)),
            Err(e) => {
                warn!(
                    plugin = %self.name,
                    file = %self.meta.exec_file.display(),
                    error = %e,
                    "Plugin file not found, excluding"
                );
                None
            }
        }
    }
}

impl LocatedPlugin {
    pub fn verify(self, checker: &dyn IdentityChecker) -> Option<VerifiedPlugin> {
        let candidate = self.0;
        match checker.parse(&candidate.meta.exec_file) {
            Ok(sum) if sum.eq_ignore_ascii_case(&candidate.meta.hash) => {
                Some(VerifiedPlugin(candidate))
            }
            Ok(sum) => {
                warn!(
                    plugin = %candidate.name,
                    expected = %candidate.meta.hash,
                    actual = %sum,
                    "Plugin hash mismatch, excluding"
                );
                None
            }
            Err(e) => {
                warn!(plugin = %candidate.name, error = %e, "Cannot hash plugin file, excluding");
                None
            }
        }
    }
}
