//! Process Instance
//!
//! Couples a [`Runner`] with a [`ProcessRegistry`] and enforces the
//! one-process-per-plugin rule.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ProcessId, ProcessRegistry, Runner, RunningProcess, SpawnRequest, Subprocess};
use crate::error::{Error, Result};

/// Runs, tracks and kills the processes of one host's plugins
pub struct ProcessInstance {
    runner: Arc<dyn Runner>,
    registry: ProcessRegistry,
}

impl Default for ProcessInstance {
    fn default() -> Self {
        Self::new(Arc::new(Subprocess::new()))
    }
}

impl ProcessInstance {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            registry: ProcessRegistry::new(),
        }
    }

    /// Create a new instance wrapped in an Arc
    pub fn new_shared(runner: Arc<dyn Runner>) -> Arc<Self> {
        Arc::new(Self::new(runner))
    }

    /// Start a plugin process.
    ///
    /// Fails with [`Error::PluginAlreadyStarted`] before touching the runner
    /// when the plugin already has a registered process. The returned process
    /// is not registered; see [`ProcessInstance::register`].
    pub async fn run(&self, request: SpawnRequest) -> Result<RunningProcess> {
        if self.registry.exists(&request.name) {
            return Err(Error::PluginAlreadyStarted(request.name));
        }
        self.runner.run(request).await
    }

    /// Record a started process as the live process for its plugin
    pub fn register(&self, process: RunningProcess) -> Result<()> {
        let name = process.name.clone();
        self.registry.register(&name, process)?;
        debug!(plugin = %name, "Registered plugin process");
        Ok(())
    }

    /// Terminate a plugin's process and forget it.
    ///
    /// The entry is removed even when the process cannot be signalled.
    pub fn kill(&self, name: &str) -> Result<()> {
        let process = self.registry.get(name)?;

        let outcome = match &process.kill {
            Some(switch) => switch.trigger(),
            None => Ok(false),
        };
        self.registry.delete(name);

        match outcome {
            Ok(true) => {
                info!(plugin = %name, pid = %process.id, "Killing plugin process");
                Ok(())
            }
            Ok(false) => {
                debug!(plugin = %name, pid = %process.id, "Plugin process already gone");
                Ok(())
            }
            Err(errno) => Err(Error::PluginCannotBeKilled(format!("{name}: {errno}"))),
        }
    }

    /// Kill every registered process, returning the failures.
    ///
    /// The registry is empty afterwards whatever the individual outcomes.
    pub fn kill_all(&self) -> Vec<Error> {
        let errors: Vec<Error> = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| self.kill(&name).err())
            .collect();

        for e in &errors {
            warn!(error = %e, "Failed to kill plugin process");
        }

        self.registry.reset_all();
        errors
    }

    /// Whether the plugin has a registered process
    pub fn is_ready(&self, name: &str) -> bool {
        self.registry.exists(name)
    }

    /// OS process id of a running plugin
    pub fn process_id(&self, name: &str) -> Result<ProcessId> {
        self.registry.get(name).map(|p| p.id)
    }

    /// Snapshot of a running plugin's process record
    pub fn process(&self, name: &str) -> Result<RunningProcess> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::process::KillSwitch;

    /// Runner that hands back fake processes and counts its calls
    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        async fn run(&self, request: SpawnRequest) -> Result<RunningProcess> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(RunningProcess::detached(request.name, ProcessId(1000 + n)))
        }
    }

    fn request(name: &str) -> SpawnRequest {
        SpawnRequest {
            name: name.to_string(),
            command: "plugin".to_string(),
            args: Vec::new(),
            port: 8080,
            grace: Duration::ZERO,
        }
    }

    fn instance() -> (ProcessInstance, Arc<CountingRunner>) {
        let runner = Arc::new(CountingRunner::default());
        (ProcessInstance::new(runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_run_and_register() {
        let (instance, runner) = instance();

        let process = instance.run(request("a")).await.unwrap();
        assert!(!instance.is_ready("a"));

        instance.register(process).unwrap();
        assert!(instance.is_ready("a"));
        assert_eq!(instance.process_id("a").unwrap(), ProcessId(1000));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_already_started_skips_runner() {
        let (instance, runner) = instance();
        instance
            .register(RunningProcess::detached("a", ProcessId(7)))
            .unwrap();

        let result = instance.run(request("a")).await;

        assert!(matches!(result, Err(Error::PluginAlreadyStarted(_))));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_triggers_switch_and_removes() {
        let (instance, _) = instance();
        let (switch, mut rx) = KillSwitch::pair();
        let mut process = RunningProcess::detached("a", ProcessId(7));
        process.kill = Some(switch.clone());
        instance.register(process).unwrap();

        instance.kill("a").unwrap();

        assert!(switch.is_spent());
        assert!(rx.try_recv().is_ok());
        assert!(!instance.is_ready("a"));
    }

    #[test]
    fn test_kill_without_switch_still_removes() {
        let (instance, _) = instance();
        instance
            .register(RunningProcess::detached("a", ProcessId(7)))
            .unwrap();

        instance.kill("a").unwrap();
        assert!(!instance.is_ready("a"));
    }

    #[test]
    fn test_kill_unsignalable_process() {
        let (instance, _) = instance();
        let (switch, _rx) = KillSwitch::for_process(ProcessId(u32::MAX));
        let mut process = RunningProcess::detached("a", ProcessId(u32::MAX));
        process.kill = Some(switch);
        instance.register(process).unwrap();

        let result = instance.kill("a");

        assert!(matches!(result, Err(Error::PluginCannotBeKilled(msg)) if msg.starts_with("a:")));
        assert!(!instance.is_ready("a"));
    }

    #[test]
    fn test_kill_all_collects_failures() {
        let (instance, _) = instance();
        let (bad, _bad_rx) = KillSwitch::for_process(ProcessId(u32::MAX));
        let (good, _good_rx) = KillSwitch::pair();
        for (name, switch) in [("bad", bad), ("good", good.clone())] {
            let mut process = RunningProcess::detached(name, ProcessId(u32::MAX));
            process.kill = Some(switch);
            instance.register(process).unwrap();
        }

        let errors = instance.kill_all();

        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::PluginCannotBeKilled(_)));
        assert!(good.is_spent());
        assert!(instance.registry().is_empty());
    }

    #[test]
    fn test_kill_missing() {
        let (instance, _) = instance();
        assert!(matches!(instance.kill("a"), Err(Error::PluginNotFound(_))));
    }

    #[test]
    fn test_kill_all_empty() {
        let (instance, _) = instance();
        assert!(instance.kill_all().is_empty());
        assert!(instance.registry().is_empty());
    }

    #[test]
    fn test_kill_all_kills_everything() {
        let (instance, _) = instance();
        let mut switches = Vec::new();
        let mut receivers = Vec::new();
        for name in ["a", "b", "c"] {
            let (switch, rx) = KillSwitch::pair();
            // "b" behaves like a process that already exited
            if name != "b" {
                receivers.push(rx);
            }
            let mut process = RunningProcess::detached(name, ProcessId(1));
            process.kill = Some(switch.clone());
            instance.register(process).unwrap();
            switches.push(switch);
        }

        let errors = instance.kill_all();

        assert!(errors.is_empty());
        assert!(switches.iter().all(KillSwitch::is_spent));
        assert!(receivers.iter_mut().all(|rx| rx.try_recv().is_ok()));
        assert!(instance.registry().is_empty());
    }
}
