//! Tether CLI
//!
//! `tether run` hosts the configured plugins and keeps them alive until the
//! process receives Ctrl+C or SIGTERM. `tether check` reports which plugins
//! each host would be allowed to run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::config::PluginInfo;
use tether::process::DEFAULT_PORT_FLAG;
use tether::supervisor::DEFAULT_INTERVAL;
use tether::{
    FnHandler, Host, Installer, Md5Checker, PluginConf, PluginConfig, ProcessInstance,
    ProtocolType, Registry, RestOptions, Signal, Subprocess, Supervisor,
};

/// How long the startup ping may take per plugin
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Tether plugin host
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Run and supervise subprocess plugins", long_about = None)]
struct Args {
    /// Configuration file (defaults to $TETHER_CONFIG, then ~/.tether/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start plugins and supervise them until interrupted
    ///
    /// Only REST plugins that declare a `port` are started. gRPC plugins need
    /// an RPC client, which only an embedding application can supply through
    /// `tether::RpcConnector`, so they are listed as skipped here.
    Run {
        /// Hosts to serve (all configured hosts when omitted)
        #[arg(long = "host")]
        hosts: Vec<String>,

        /// Address REST plugins listen on
        #[arg(long, default_value = "127.0.0.1")]
        addr: String,

        /// Supervisor polling interval in seconds
        #[arg(long, default_value_t = DEFAULT_INTERVAL.as_secs())]
        interval: u64,

        /// Flag used to pass the port to plugin executables
        #[arg(long, default_value = DEFAULT_PORT_FLAG, allow_hyphen_values = true)]
        port_flag: String,
    },

    /// Verify plugin files and list what each host may run
    Check {
        /// Hosts to check (all configured hosts when omitted)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let (path, config) = load_config(args.config.clone()).await?;
    init_tracing(config.settings.debug, args.json);
    info!(path = %path.display(), "Using configuration");

    let config = Arc::new(config);
    match args.command {
        Command::Run {
            hosts,
            addr,
            interval,
            port_flag,
        } => {
            let hosts = selected_hosts(&config, &hosts)?;
            run(config, hosts, &addr, Duration::from_secs(interval), &port_flag).await
        }
        Command::Check { hosts } => {
            let hosts = selected_hosts(&config, &hosts)?;
            check(config, &hosts)
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<(PathBuf, PluginConfig)> {
    match path {
        Some(path) => {
            let config = PluginConfig::load(&path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?;
            Ok((path, config))
        }
        None => PluginConfig::discover_and_load()
            .await
            .context("Failed to load plugin configuration"),
    }
}

fn init_tracing(debug: bool, json: bool) {
    let default = if debug { "tether=debug" } else { "tether=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Requested hosts, or every configured host
fn selected_hosts(config: &PluginConfig, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.host_names());
    }

    for host in requested {
        if !config.hosts.contains_key(host) {
            bail!("Unknown host: {host}");
        }
    }
    Ok(requested.to_vec())
}

/// Connection settings for a plugin the CLI can reach on its own
fn plugin_conf(info: &PluginInfo, addr: &str) -> Option<PluginConf> {
    let port = info.port?;
    match info.protocol_type.parse().ok()? {
        ProtocolType::Rest => Some(PluginConf::rest(RestOptions::new(addr, port))),
        // No RPC client ships with the CLI; see `Command::Run`
        ProtocolType::Grpc => None,
    }
}

fn build_hosts(config: &Arc<PluginConfig>, hosts: &[String], addr: &str, port_flag: &str) -> Vec<Host> {
    let runner = Arc::new(Subprocess::new().with_port_flag(port_flag));

    hosts
        .iter()
        .map(|name| {
            let mut host = Host::new(name.clone(), config.clone())
                .with_process(ProcessInstance::new_shared(runner.clone()));

            let listed = config.hosts.get(name).map(|h| h.plugins.as_slice()).unwrap_or_default();
            for plugin in listed {
                let Some(info) = config.plugins.get(plugin) else {
                    continue;
                };
                match plugin_conf(info, addr) {
                    Some(conf) => host = host.with_plugin(plugin.clone(), conf),
                    None => warn!(
                        host = %name,
                        plugin = %plugin,
                        protocol = %info.protocol_type,
                        "No port or no transport for plugin, it will not be started"
                    ),
                }
            }
            host
        })
        .collect()
}

async fn run(
    config: Arc<PluginConfig>,
    hosts: Vec<String>,
    addr: &str,
    interval: Duration,
    port_flag: &str,
) -> Result<()> {
    let registry = Registry::new(build_hosts(&config, &hosts, addr, port_flag))
        .install()
        .context("Failed to install plugin hosts")?;
    let registry = Arc::new(registry);

    // Start everything that has connection settings and ping it once
    let mut targets = Vec::new();
    for host in registry.hosts() {
        for plugin in registry.container(host.name())?.plugins().into_keys() {
            if host.plugin_conf(&plugin).is_ok() {
                targets.push((host.name().to_string(), plugin));
            }
        }
    }

    let results = join_all(targets.iter().map(|(host, plugin)| {
        let registry = registry.clone();
        async move {
            let caller = registry.get_caller(host, plugin).await?;
            match tokio::time::timeout(PING_TIMEOUT, caller.ping()).await {
                Ok(reply) => reply,
                Err(_) => Err(tether::Error::PluginCall(format!(
                    "no ping reply within {PING_TIMEOUT:?}"
                ))),
            }
        }
    }))
    .await;

    for ((host, plugin), result) in targets.iter().zip(results) {
        match result {
            Ok(reply) => info!(host = %host, plugin = %plugin, %reply, "Plugin up"),
            Err(e) => error!(host = %host, plugin = %plugin, error = %e, "Plugin did not answer"),
        }
    }

    let mut supervisor = Supervisor::new(registry.clone()).with_interval(interval);
    supervisor.setup(vec![FnHandler::shared(|signal: &Signal| {
        warn!(host = %signal.host, plugin = %signal.plugin, pid = %signal.pid, "Plugin died");
    })])?;
    supervisor.start();

    shutdown_signal().await;

    supervisor.shutdown().await;
    for e in registry.kill_plugins() {
        warn!(error = %e, "Plugin did not stop cleanly");
    }

    info!("Tether shutdown complete");
    Ok(())
}

fn check(config: Arc<PluginConfig>, hosts: &[String]) -> Result<()> {
    let checker = Arc::new(Md5Checker::new());
    let mut failed = 0usize;

    for host in hosts {
        let installer = Installer::new(host.clone(), Some(config.clone()), checker.clone());
        match installer.install(installer.resolve()) {
            Ok(plugins) => {
                println!("{host}:");
                for (name, meta) in &plugins {
                    println!("  {name} ({}) {}", meta.protocol_type, meta.exec_path);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{host}: {e}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} hosts have no runnable plugins", hosts.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received terminate signal, shutting down..."),
    }
}
