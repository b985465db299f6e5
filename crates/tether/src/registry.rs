//! Plugin Registry
//!
//! Entry point for applications hosting several hosts. Each [`Host`] names the
//! configuration it reads, how plugin files are verified, the process instance
//! its plugins run in, and how to reach each plugin ([`PluginConf`]).
//!
//! ```ignore
//! let host = Host::new("billing", config)
//!     .with_plugin("invoice", PluginConf::rest(RestOptions::new("localhost", 8081)));
//! let registry = Registry::new(vec![host]).install()?;
//! let plugin = registry.get_caller("billing", "invoice").await?;
//! let out = plugin.exec("render", b"{}").await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::caller::{
    Plugin, ProtocolOptions, ProtocolType, RestOptions, RpcOptions, build_protocol,
};
use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::executor::{Container, Executor, ExecutorOptions, Registration};
use crate::host::{IdentityChecker, Installer, Md5Checker, Plugins};
use crate::process::{ProcessId, ProcessInstance};

// ─────────────────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────────────────

/// How to reach one plugin
#[derive(Debug, Clone, Default)]
pub struct PluginConf {
    pub protocol: ProtocolOptions,
}

impl PluginConf {
    pub fn rest(options: RestOptions) -> Self {
        Self {
            protocol: ProtocolOptions::rest(options),
        }
    }

    pub fn rpc(options: RpcOptions) -> Self {
        Self {
            protocol: ProtocolOptions::rpc(options),
        }
    }
}

/// A consumer of plugins and everything needed to serve it
pub struct Host {
    name: String,
    config: Option<Arc<PluginConfig>>,
    checker: Arc<dyn IdentityChecker>,
    process: Arc<ProcessInstance>,
    plugins: HashMap<String, PluginConf>,
}

impl Host {
    /// Host with MD5 verification and real subprocesses
    pub fn new(name: impl Into<String>, config: Arc<PluginConfig>) -> Self {
        Self {
            name: name.into(),
            config: Some(config),
            checker: Arc::new(Md5Checker::new()),
            process: Arc::new(ProcessInstance::default()),
            plugins: HashMap::new(),
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn IdentityChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_process(mut self, process: Arc<ProcessInstance>) -> Self {
        self.process = process;
        self
    }

    /// Add or replace the connection settings of a plugin
    pub fn with_plugin(mut self, name: impl Into<String>, conf: PluginConf) -> Self {
        self.plugins.insert(name.into(), conf);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> &Arc<ProcessInstance> {
        &self.process
    }

    pub fn plugin_conf(&self, plugin: &str) -> Result<&PluginConf> {
        self.plugins
            .get(plugin)
            .ok_or_else(|| Error::PluginConfNotFound(plugin.to_string()))
    }

    fn registration(&self) -> Registration {
        let installer = Installer::new(self.name.clone(), self.config.clone(), self.checker.clone());
        Registration::new(installer, self.process.clone())
    }
}

/// Installed plugins of one host
#[derive(Debug, Clone)]
pub struct HostPlugins {
    pub host: String,
    pub plugins: Plugins,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// All hosts of the application and their executor
pub struct Registry {
    hosts: Vec<Host>,
    executor: Executor,
}

impl Registry {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self::with_options(hosts, ExecutorOptions::default())
    }

    pub fn with_options(hosts: Vec<Host>, options: ExecutorOptions) -> Self {
        let registrations = hosts.iter().map(Host::registration).collect();
        Self {
            executor: Executor::new(registrations, options),
            hosts,
        }
    }

    /// Install every host, reporting all hosts that failed
    pub fn install(self) -> Result<Self> {
        let mut failures = Vec::new();
        for host in &self.hosts {
            let container = self.executor.from_host(host.name())?;
            if let Err(e) = container.setup() {
                warn!(host = %host.name(), error = %e, "Host setup failed");
                failures.push((host.name().to_string(), e));
            }
        }

        if !failures.is_empty() {
            return Err(Error::SetupFailed(failures));
        }

        info!(hosts = self.hosts.len(), "Plugin hosts installed");
        Ok(self)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| Error::NoHosts(name.to_string()))
    }

    pub fn container(&self, host: &str) -> Result<Arc<Container>> {
        self.host(host)?;
        self.executor.from_host(host)
    }

    /// Port a plugin is reached on, per its declared protocol
    pub fn port(&self, host: &str, plugin: &str) -> Result<u16> {
        let conf = self.host(host)?.plugin_conf(plugin)?;
        let meta = self.container(host)?.plugin_meta(plugin)?;
        let protocol: ProtocolType = meta.protocol_type.parse()?;

        conf.protocol
            .port(protocol)
            .ok_or_else(|| Error::PluginConfNotFound(plugin.to_string()))
    }

    /// Callable handle for a plugin, starting its process when needed
    pub async fn get_caller(&self, host: &str, plugin: &str) -> Result<Plugin> {
        let conf = self.host(host)?.plugin_conf(plugin)?;
        let container = self.container(host)?;
        let port = self.port(host, plugin)?;

        if !container.is_plugin_ready(plugin) {
            match container.run(plugin, port).await {
                Ok(()) => {}
                Err(Error::PluginAlreadyStarted(_)) => {
                    debug!(host = %host, plugin = %plugin, "Plugin started concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        let factory = build_protocol(&conf.protocol)
            .ok_or_else(|| Error::PluginConfNotFound(plugin.to_string()))?;
        container.get(plugin, port, &factory)
    }

    /// Installed plugins of every host, in host order
    pub fn all_plugins(&self) -> Result<Vec<HostPlugins>> {
        self.hosts
            .iter()
            .map(|h| {
                Ok(HostPlugins {
                    host: h.name.clone(),
                    plugins: self.executor.from_host(&h.name)?.plugins(),
                })
            })
            .collect()
    }

    /// Kill the plugin processes of every host
    pub fn kill_plugins(&self) -> Vec<Error> {
        self.hosts
            .iter()
            .flat_map(|h| {
                info!(host = %h.name, "Killing all plugins");
                h.process.kill_all()
            })
            .collect()
    }

    pub fn pid(&self, host: &str, plugin: &str) -> Result<ProcessId> {
        self.host(host)?.process.process_id(plugin)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::Json;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use parking_lot::Mutex;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::caller::rest::{ExecRequest, JsonResponse};
    use crate::process::{Runner, RunningProcess, SpawnRequest};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    /// Runner that records requests without starting anything
    #[derive(Default)]
    struct RecordingRunner {
        ports: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl Runner for RecordingRunner {
        async fn run(&self, request: SpawnRequest) -> Result<RunningProcess> {
            self.ports.lock().push(request.port);
            Ok(RunningProcess::detached(request.name, ProcessId(77)))
        }
    }

    fn config(file: &NamedTempFile) -> Arc<PluginConfig> {
        let toml = format!(
            r#"
            [plugins.P]
            md5 = "{EMPTY_MD5}"
            exec = "plugin-p"
            exec_file = "{file}"
            exec_time = 0
            protocol_type = "rest"

            [plugins.Q]
            md5 = "{EMPTY_MD5}"
            exec = "plugin-q"
            exec_file = "{file}"
            protocol_type = "grpc"

            [hosts.H]
            plugins = ["P", "Q"]

            [hosts.empty]
            plugins = []
            "#,
            file = file.path().display()
        );
        Arc::new(PluginConfig::from_toml_str(&toml).unwrap())
    }

    async fn stub_plugin() -> u16 {
        let router = Router::new()
            .route(
                "/ping",
                get(|| async { (StatusCode::OK, Json(JsonResponse::success("pong"))) }),
            )
            .route(
                "/exec",
                post(|Json(req): Json<ExecRequest>| async move {
                    (StatusCode::ACCEPTED, Json(JsonResponse::success(req.payload)))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn host(file: &NamedTempFile, port: u16) -> (Host, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::default());
        let host = Host::new("H", config(file))
            .with_process(ProcessInstance::new_shared(runner.clone()))
            .with_plugin(
                "P",
                PluginConf::rest(
                    RestOptions::new("127.0.0.1", port).with_timeout(Duration::from_secs(2)),
                ),
            );
        (host, runner)
    }

    #[tokio::test]
    async fn test_end_to_end_rest_ping() {
        let file = NamedTempFile::new().unwrap();
        let port = stub_plugin().await;
        let (host, runner) = host(&file, port);

        let registry = Registry::new(vec![host]).install().unwrap();
        let plugin = registry.get_caller("H", "P").await.unwrap();

        assert_eq!(plugin.protocol(), ProtocolType::Rest);
        assert_eq!(plugin.ping().await.unwrap(), "pong");
        assert_eq!(plugin.exec("echo", b"abc").await.unwrap(), b"abc");

        // Started once, on the configured port
        registry.get_caller("H", "P").await.unwrap();
        assert_eq!(*runner.ports.lock(), vec![port]);
        assert_eq!(registry.pid("H", "P").unwrap(), ProcessId(77));
    }

    #[tokio::test]
    async fn test_get_caller_errors() {
        let file = NamedTempFile::new().unwrap();
        let (host, _) = host(&file, 1);
        let registry = Registry::new(vec![host]).install().unwrap();

        assert!(matches!(
            registry.get_caller("nope", "P").await,
            Err(Error::NoHosts(_))
        ));
        // Q is installed but has no connection settings
        assert!(matches!(
            registry.get_caller("H", "Q").await,
            Err(Error::PluginConfNotFound(_))
        ));
    }

    #[test]
    fn test_install_aggregates_failures() {
        let file = NamedTempFile::new().unwrap();
        let (good, _) = host(&file, 1);
        let empty = Host::new("empty", config(&file));
        let unknown = Host::new("unknown", config(&file));

        let result = Registry::new(vec![good, empty, unknown]).install();

        match result {
            Err(Error::SetupFailed(failures)) => {
                let hosts: Vec<_> = failures.iter().map(|(h, _)| h.as_str()).collect();
                assert_eq!(hosts, vec!["empty", "unknown"]);
                assert!(failures.iter().all(|(_, e)| matches!(e, Error::NoPluginsAvailable)));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("install should fail"),
        }
    }

    #[test]
    fn test_all_plugins() {
        let file = NamedTempFile::new().unwrap();
        let (host, _) = host(&file, 1);
        let registry = Registry::new(vec![host]).install().unwrap();

        let all = registry.all_plugins().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].host, "H");
        assert_eq!(all[0].plugins.keys().collect::<Vec<_>>(), vec!["P", "Q"]);
    }

    #[tokio::test]
    async fn test_kill_plugins() {
        let file = NamedTempFile::new().unwrap();
        let (host, _) = host(&file, 1);
        let registry = Registry::new(vec![host]).install().unwrap();
        let container = registry.container("H").unwrap();
        container.run("P", 1).await.unwrap();
        assert!(container.is_plugin_ready("P"));

        assert!(registry.kill_plugins().is_empty());
        assert!(!container.is_plugin_ready("P"));
        assert!(matches!(registry.pid("H", "P"), Err(Error::PluginNotFound(_))));
    }
}
