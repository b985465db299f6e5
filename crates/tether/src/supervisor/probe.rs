//! Liveness probes.

use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{trace, warn};

use crate::error::Error;
use crate::process::ProcessId;
use crate::registry::Registry;

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Registered under this pid but no longer running
    Dead(ProcessId),
    /// Never started, or killed on purpose
    NotStarted,
}

/// Decides whether a plugin needs recovering
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, registry: &Registry, host: &str, plugin: &str) -> Liveness;
}

/// Sends signal 0 to the registered process id
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

#[async_trait]
impl LivenessProbe for ProcessProbe {
    async fn probe(&self, registry: &Registry, host: &str, plugin: &str) -> Liveness {
        let pid = match registry.pid(host, plugin) {
            Ok(pid) => pid,
            Err(Error::PluginNotFound(_)) => return Liveness::NotStarted,
            Err(e) => {
                warn!(host = %host, plugin = %plugin, error = %e, "Cannot resolve plugin pid");
                return Liveness::NotStarted;
            }
        };

        let Ok(raw) = i32::try_from(pid.0) else {
            return Liveness::Dead(pid);
        };

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => {
                trace!(host = %host, plugin = %plugin, %pid, "Plugin alive");
                Liveness::Alive
            }
            Err(errno) => {
                warn!(host = %host, plugin = %plugin, %pid, error = %errno, "Plugin process is gone");
                Liveness::Dead(pid)
            }
        }
    }
}
