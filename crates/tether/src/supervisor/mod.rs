//! Plugin Supervisor
//!
//! Polls every installed plugin on a fixed interval and feeds the ones that
//! died into a handler pipeline. The last handler is always [`AutoRestart`].
//!
//! ```text
//!   ticker ──tick──> probe task per plugin ──Signal──> dispatcher ──> handlers
//! ```
//!
//! The supervisor is `Idle` until [`Supervisor::start`] and returns to `Idle`
//! after [`Supervisor::shutdown`].

mod probe;

pub use probe::{Liveness, LivenessProbe, ProcessProbe};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::process::ProcessId;
use crate::registry::Registry;

/// Default polling period
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

const SIGNAL_BUFFER: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Signals & Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// A plugin found dead
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signal {
    pub host: String,
    pub plugin: String,
    /// Process that was probed and found gone
    pub pid: ProcessId,
}

/// A plugin the supervisor watches
#[derive(Debug, Clone)]
struct Target {
    host: String,
    plugin: String,
}

/// Reacts to dead plugins
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, signal: &Signal);
}

/// [`SignalHandler`] from a plain closure
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&Signal) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }

    pub fn shared(f: F) -> Arc<dyn SignalHandler> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F> SignalHandler for FnHandler<F>
where
    F: Fn(&Signal) + Send + Sync + 'static,
{
    async fn handle(&self, signal: &Signal) {
        (self.0)(signal)
    }
}

/// Kills what is left of a dead plugin and starts it again on its port.
///
/// Signals whose pid no longer matches the registered process are stale: the
/// plugin was already restarted or stopped, so they are ignored.
pub struct AutoRestart {
    registry: Arc<Registry>,
}

impl AutoRestart {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SignalHandler for AutoRestart {
    async fn handle(&self, signal: &Signal) {
        let Signal { host, plugin, pid } = signal;

        match self.registry.pid(host, plugin) {
            Ok(current) if current == *pid => {}
            Ok(current) => {
                debug!(host = %host, plugin = %plugin, %pid, %current, "Ignoring stale signal");
                return;
            }
            Err(e) => {
                debug!(host = %host, plugin = %plugin, %pid, error = %e, "Ignoring signal for stopped plugin");
                return;
            }
        }

        info!(host = %host, plugin = %plugin, %pid, "Restarting plugin");

        let container = match self.registry.container(host) {
            Ok(c) => c,
            Err(e) => {
                error!(host = %host, error = %e, "Restart aborted: no container");
                return;
            }
        };

        let port = match self.registry.port(host, plugin) {
            Ok(port) => port,
            Err(e) => {
                error!(host = %host, plugin = %plugin, error = %e, "Restart aborted: no port");
                return;
            }
        };

        if let Err(e) = container.process().kill(plugin) {
            error!(host = %host, plugin = %plugin, error = %e, "Restart aborted: kill failed");
            return;
        }

        match container.run(plugin, port).await {
            Ok(()) => info!(host = %host, plugin = %plugin, port, "Plugin restarted"),
            Err(e) => error!(host = %host, plugin = %plugin, error = %e, "Plugin restart failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

enum State {
    Idle,
    Watching {
        stop: oneshot::Sender<()>,
        ticker: JoinHandle<()>,
        dispatcher: JoinHandle<()>,
    },
}

/// Periodic liveness watcher for every plugin of a [`Registry`]
pub struct Supervisor {
    registry: Arc<Registry>,
    interval: Duration,
    probe: Arc<dyn LivenessProbe>,
    targets: Arc<Vec<Target>>,
    handlers: Arc<Vec<Arc<dyn SignalHandler>>>,
    state: State,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            interval: DEFAULT_INTERVAL,
            probe: Arc::new(ProcessProbe),
            targets: Arc::new(Vec::new()),
            handlers: Arc::new(Vec::new()),
            state: State::Idle,
        }
    }

    /// Zero keeps the current interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.state, State::Watching { .. })
    }

    /// Snapshot the installed plugins and install the handler pipeline.
    ///
    /// `handlers` run in order, followed by [`AutoRestart`].
    pub fn setup(&mut self, mut handlers: Vec<Arc<dyn SignalHandler>>) -> Result<()> {
        let targets: Vec<Target> = self
            .registry
            .all_plugins()?
            .into_iter()
            .flat_map(|hp| {
                let host = hp.host;
                hp.plugins.into_keys().map(move |plugin| Target {
                    host: host.clone(),
                    plugin,
                })
            })
            .collect();

        handlers.push(Arc::new(AutoRestart::new(self.registry.clone())));

        debug!(targets = targets.len(), handlers = handlers.len(), "Supervisor set up");
        self.targets = Arc::new(targets);
        self.handlers = Arc::new(handlers);
        Ok(())
    }

    /// Begin polling; the first tick comes one interval from now
    pub fn start(&mut self) {
        if self.is_watching() {
            warn!("Supervisor already started");
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        let ticker = tokio::spawn(watch(
            self.registry.clone(),
            self.probe.clone(),
            self.targets.clone(),
            self.interval,
            signal_tx,
            stop_rx,
        ));
        let dispatcher = tokio::spawn(dispatch(self.handlers.clone(), signal_rx));

        info!(interval = ?self.interval, plugins = self.targets.len(), "Supervisor started");
        self.state = State::Watching {
            stop: stop_tx,
            ticker,
            dispatcher,
        };
    }

    /// Stop polling and wait for pending signals to be handled
    pub async fn shutdown(&mut self) {
        let State::Watching {
            stop,
            ticker,
            dispatcher,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return;
        };

        let _ = stop.send(());
        if let Err(e) = ticker.await {
            warn!(error = %e, "Supervisor ticker ended abnormally");
        }
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "Supervisor dispatcher ended abnormally");
        }
        info!("Supervisor stopped");
    }
}

async fn watch(
    registry: Arc<Registry>,
    probe: Arc<dyn LivenessProbe>,
    targets: Arc<Vec<Target>>,
    period: Duration,
    signals: mpsc::Sender<Signal>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = tick.tick() => {
                for target in targets.iter() {
                    let registry = registry.clone();
                    let probe = probe.clone();
                    let signals = signals.clone();
                    let target = target.clone();

                    tokio::spawn(async move {
                        let Target { host, plugin } = target;
                        if let Liveness::Dead(pid) = probe.probe(&registry, &host, &plugin).await {
                            let _ = signals.send(Signal { host, plugin, pid }).await;
                        }
                    });
                }
            }
        }
    }
}

async fn dispatch(handlers: Arc<Vec<Arc<dyn SignalHandler>>>, mut signals: mpsc::Receiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        debug!(host = %signal.host, plugin = %signal.plugin, "Dispatching plugin signal");
        for handler in handlers.iter() {
            handler.handle(&signal).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::sys::signal::{Signal as OsSignal, kill};
    use nix::unistd::Pid;
    use parking_lot::Mutex;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::caller::RestOptions;
    use crate::config::PluginConfig;
    use crate::host::{IdentityChecker, Md5Checker};
    use crate::process::{ProcessId, ProcessInstance, Runner, RunningProcess, SpawnRequest};
    use crate::registry::{Host, PluginConf};

    /// Probe with a fixed answer that counts its calls
    struct FixedProbe {
        liveness: Liveness,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(liveness: Liveness) -> Arc<Self> {
            Arc::new(Self {
                liveness,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LivenessProbe for FixedProbe {
        async fn probe(&self, _: &Registry, _: &str, _: &str) -> Liveness {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.liveness
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl Runner for NoopRunner {
        async fn run(&self, request: SpawnRequest) -> crate::Result<RunningProcess> {
            Ok(RunningProcess::detached(request.name, ProcessId(1)))
        }
    }

    fn config(exec: &str, args: &[&str], file: &Path, hash: &str) -> Arc<PluginConfig> {
        let args = args
            .iter()
            .map(|a| format!("{a:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!(
            r#"
            [plugins.sleeper]
            md5 = "{hash}"
            exec = "{exec}"
            exec_args = [{args}]
            exec_file = "{file}"
            protocol_type = "rest"

            [hosts.H]
            plugins = ["sleeper"]
            "#,
            file = file.display()
        );
        Arc::new(PluginConfig::from_toml_str(&toml).unwrap())
    }

    /// Hands out pids 2, 3, 4, ...
    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        async fn run(&self, request: SpawnRequest) -> crate::Result<RunningProcess> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(RunningProcess::detached(request.name, ProcessId(n + 2)))
        }
    }

    /// Reports pid 1 as dead and every other registered pid as alive
    struct FirstPidDead;

    #[async_trait]
    impl LivenessProbe for FirstPidDead {
        async fn probe(&self, registry: &Registry, host: &str, plugin: &str) -> Liveness {
            match registry.pid(host, plugin) {
                Ok(pid) if pid == ProcessId(1) => Liveness::Dead(pid),
                Ok(_) => Liveness::Alive,
                Err(_) => Liveness::NotStarted,
            }
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl SignalHandler for SlowHandler {
        async fn handle(&self, _: &Signal) {
            tokio::time::sleep(self.0).await;
        }
    }

    fn fake_registry(file: &mut NamedTempFile) -> Arc<Registry> {
        registry_with_runner(file, Arc::new(NoopRunner))
    }

    fn registry_with_runner(file: &mut NamedTempFile, runner: Arc<dyn Runner>) -> Arc<Registry> {
        file.write_all(b"plugin").unwrap();
        let hash = Md5Checker::new().parse(file.path()).unwrap();
        let host = Host::new("H", config("sleeper", &[], file.path(), &hash))
            .with_process(ProcessInstance::new_shared(runner))
            .with_plugin("sleeper", PluginConf::rest(RestOptions::new("127.0.0.1", 9555)));
        Arc::new(Registry::new(vec![host]).install().unwrap())
    }

    fn is_alive(pid: ProcessId) -> bool {
        kill(Pid::from_raw(pid.0 as i32), None).is_ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_signal_per_tick() {
        let mut file = NamedTempFile::new().unwrap();
        let registry = fake_registry(&mut file);
        let interval = Duration::from_secs(5);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut supervisor = Supervisor::new(registry)
            .with_interval(interval)
            .with_probe(FixedProbe::new(Liveness::Dead(ProcessId(1))));
        supervisor
            .setup(vec![FnHandler::shared(move |s: &Signal| {
                seen_clone.lock().push(s.clone())
            })])
            .unwrap();

        supervisor.start();
        tokio::time::sleep(interval.mul_f64(5.5)).await;
        supervisor.shutdown().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(
            seen.iter()
                .all(|s| s.host == "H" && s.plugin == "sleeper" && s.pid == ProcessId(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_signals_do_not_restart_healthy_plugin() {
        let mut file = NamedTempFile::new().unwrap();
        let runner = Arc::new(CountingRunner::default());
        let registry = registry_with_runner(&mut file, runner.clone());
        registry
            .container("H")
            .unwrap()
            .process()
            .register(RunningProcess::detached("sleeper", ProcessId(1)))
            .unwrap();

        // A slow handler lets several signals for pid 1 pile up before the
        // first restart happens
        let mut supervisor = Supervisor::new(registry.clone())
            .with_interval(Duration::from_secs(5))
            .with_probe(Arc::new(FirstPidDead));
        supervisor
            .setup(vec![Arc::new(SlowHandler(Duration::from_secs(12))) as Arc<dyn SignalHandler>])
            .unwrap();

        supervisor.start();
        tokio::time::sleep(Duration::from_secs(60)).await;
        supervisor.shutdown().await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pid("H", "sleeper").unwrap(), ProcessId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_ignores_stopped_plugin() {
        let mut file = NamedTempFile::new().unwrap();
        let runner = Arc::new(CountingRunner::default());
        let registry = registry_with_runner(&mut file, runner.clone());

        let signal = Signal {
            host: "H".to_string(),
            plugin: "sleeper".to_string(),
            pid: ProcessId(1),
        };
        AutoRestart::new(registry.clone()).handle(&signal).await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(registry.pid("H", "sleeper").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_before_first_interval() {
        let mut file = NamedTempFile::new().unwrap();
        let registry = fake_registry(&mut file);
        let probe = FixedProbe::new(Liveness::Dead(ProcessId(1)));

        let mut supervisor = Supervisor::new(registry).with_probe(probe.clone());
        supervisor.setup(Vec::new()).unwrap();
        supervisor.start();
        assert!(supervisor.is_watching());

        tokio::time::sleep(DEFAULT_INTERVAL.mul_f64(0.9)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        supervisor.shutdown().await;
        assert!(!supervisor.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alive_and_unstarted_plugins_emit_nothing() {
        let mut file = NamedTempFile::new().unwrap();
        let registry = fake_registry(&mut file);

        for liveness in [Liveness::Alive, Liveness::NotStarted] {
            let count = Arc::new(AtomicUsize::new(0));
            let count_clone = count.clone();
            let mut supervisor = Supervisor::new(registry.clone())
                .with_interval(Duration::from_secs(1))
                .with_probe(FixedProbe::new(liveness));
            supervisor
                .setup(vec![FnHandler::shared(move |_: &Signal| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                })])
                .unwrap();

            supervisor.start();
            tokio::time::sleep(Duration::from_secs(10)).await;
            supervisor.shutdown().await;

            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_run_in_order() {
        let mut file = NamedTempFile::new().unwrap();
        let registry = fake_registry(&mut file);

        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());
        let mut supervisor = Supervisor::new(registry)
            .with_interval(Duration::from_secs(1))
            .with_probe(FixedProbe::new(Liveness::Dead(ProcessId(1))));
        supervisor
            .setup(vec![
                FnHandler::shared(move |_: &Signal| first.lock().push("first")),
                FnHandler::shared(move |_: &Signal| second.lock().push("second")),
            ])
            .unwrap();

        supervisor.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        supervisor.shutdown().await;

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_probe_skips_unstarted() {
        let mut file = NamedTempFile::new().unwrap();
        let registry = fake_registry(&mut file);

        let liveness = ProcessProbe.probe(&registry, "H", "sleeper").await;
        assert_eq!(liveness, Liveness::NotStarted);
    }

    #[tokio::test]
    async fn test_auto_restart_real_process() {
        let sh = Path::new("/bin/sh");
        let hash = Md5Checker::new().parse(sh).unwrap();
        let host = Host::new("H", config("/bin/sh", &["-c", "exec sleep 30", "sh"], sh, &hash))
            .with_plugin("sleeper", PluginConf::rest(RestOptions::new("127.0.0.1", 9555)));
        let registry = Arc::new(Registry::new(vec![host]).install().unwrap());

        registry.container("H").unwrap().run("sleeper", 9555).await.unwrap();
        let first = registry.pid("H", "sleeper").unwrap();
        assert_eq!(
            ProcessProbe.probe(&registry, "H", "sleeper").await,
            Liveness::Alive
        );

        // Crash the plugin behind the supervisor's back
        kill(Pid::from_raw(first.0 as i32), OsSignal::SIGKILL).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while is_alive(first) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_alive(first));

        let mut supervisor = Supervisor::new(registry.clone()).with_interval(Duration::from_millis(100));
        supervisor.setup(Vec::new()).unwrap();
        supervisor.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut restarted = None;
        while tokio::time::Instant::now() < deadline {
            match registry.pid("H", "sleeper") {
                Ok(pid) if pid != first => {
                    restarted = Some(pid);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        supervisor.shutdown().await;

        let restarted = restarted.unwrap();
        assert!(is_alive(restarted));
        assert!(registry.kill_plugins().is_empty());
    }
}
