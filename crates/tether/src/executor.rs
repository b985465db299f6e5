//! Executor
//!
//! Binds each host's installer output to the [`ProcessInstance`] that runs its
//! plugins. A [`Container`] is the per-host view: it starts authorized plugins
//! on demand and mints [`Plugin`] handles for them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::caller::{CallerFactory, Plugin, ProtocolType, RetryCaller, RetryPolicy};
use crate::error::{Error, Result};
use crate::host::{Installer, PluginMeta, Plugins};
use crate::process::{ProcessInstance, SpawnRequest};

/// Settings shared by every container of an executor
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Retry policy wrapped around every caller handed out
    pub retry: RetryPolicy,
}

/// One host and the process instance that runs its plugins
#[derive(Clone)]
pub struct Registration {
    pub installer: Installer,
    pub process: Arc<ProcessInstance>,
}

impl Registration {
    pub fn new(installer: Installer, process: Arc<ProcessInstance>) -> Self {
        Self { installer, process }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Host name → container
pub struct Executor {
    containers: HashMap<String, Arc<Container>>,
}

impl Executor {
    pub fn new(registrations: Vec<Registration>, options: ExecutorOptions) -> Self {
        let containers = registrations
            .into_iter()
            .map(|reg| {
                let host = reg.installer.hostname().to_string();
                let container = Container::new(reg.installer, reg.process, options.retry.clone());
                (host, Arc::new(container))
            })
            .collect();

        Self { containers }
    }

    /// Container of a registered host
    pub fn from_host(&self, host: &str) -> Result<Arc<Container>> {
        self.containers
            .get(host)
            .cloned()
            .ok_or_else(|| Error::NoHosts(host.to_string()))
    }

    /// Registered host names, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.containers.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Container
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ContainerState {
    installed: bool,
    plugins: Plugins,
}

/// Installed plugins of one host plus the processes running them
pub struct Container {
    installer: Installer,
    process: Arc<ProcessInstance>,
    retry: RetryPolicy,
    state: RwLock<ContainerState>,
}

impl Container {
    pub fn new(installer: Installer, process: Arc<ProcessInstance>, retry: RetryPolicy) -> Self {
        Self {
            installer,
            process,
            retry,
            state: RwLock::new(ContainerState::default()),
        }
    }

    pub fn hostname(&self) -> &str {
        self.installer.hostname()
    }

    /// Resolve and install the host's plugins; a no-op once installed
    pub fn setup(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.installed {
            return Ok(());
        }

        state.plugins = self.installer.install(self.installer.resolve())?;
        state.installed = true;
        debug!(host = %self.hostname(), plugins = state.plugins.len(), "Container ready");
        Ok(())
    }

    /// Start an installed plugin listening on `port`
    pub async fn run(&self, name: &str, port: u16) -> Result<()> {
        let meta = self.plugin_meta(name)?;

        let request = SpawnRequest {
            name: name.to_string(),
            command: meta.exec_path.clone(),
            args: meta.exec_args.clone(),
            port,
            grace: meta.exec_time,
        };

        let process = self.process.run(request).await?;
        if let Err(e) = self.process.register(process.clone()) {
            warn!(host = %self.hostname(), plugin = %name, "Plugin started twice, stopping duplicate");
            if let Some(Err(errno)) = process.kill.as_ref().map(|switch| switch.trigger()) {
                warn!(host = %self.hostname(), plugin = %name, pid = %process.id, error = %errno, "Failed to stop duplicate");
            }
            return Err(e);
        }

        info!(host = %self.hostname(), plugin = %name, port, pid = %process.id, "Plugin running");
        Ok(())
    }

    /// Handle for calling an installed plugin on `port`
    pub fn get(&self, name: &str, port: u16, factory: &CallerFactory) -> Result<Plugin> {
        let meta = self.plugin_meta(name)?;
        let protocol: ProtocolType = meta.protocol_type.parse()?;

        let caller = factory(protocol, port)
            .ok_or_else(|| Error::ProtocolUnknown(protocol.to_string()))?;

        Ok(Plugin::new(
            name,
            meta,
            protocol,
            RetryCaller::new(caller, self.retry.clone()),
        ))
    }

    pub fn is_plugin_ready(&self, name: &str) -> bool {
        self.process.is_ready(name)
    }

    pub fn plugin_meta(&self, name: &str) -> Result<Arc<PluginMeta>> {
        self.state
            .read()
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    /// Snapshot of the installed plugins
    pub fn plugins(&self) -> Plugins {
        self.state.read().plugins.clone()
    }

    pub fn is_installed(&self) -> bool {
        self.state.read().installed
    }

    pub fn plugin_len(&self) -> usize {
        self.state.read().plugins.len()
    }

    pub fn process(&self) -> &Arc<ProcessInstance> {
        &self.process
    }
}
