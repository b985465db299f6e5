//! Subprocess Runner
//!
//! Spawns plugin executables as OS processes, each in its own process group so
//! signals aimed at the supervising process do not reach them.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{KillSwitch, OutputBuffer, ProcessId, Runner, RunningProcess, SpawnRequest};
use crate::error::{Error, Result};

/// Flag placed before the port number on the plugin command line
pub const DEFAULT_PORT_FLAG: &str = "--port";

/// How long a plugin may take to exit after SIGTERM before it is killed
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Runner`] backed by real OS processes
#[derive(Debug, Clone)]
pub struct Subprocess {
    port_flag: String,
}

impl Default for Subprocess {
    fn default() -> Self {
        Self::new()
    }
}

impl Subprocess {
    pub fn new() -> Self {
        Self {
            port_flag: DEFAULT_PORT_FLAG.to_string(),
        }
    }

    /// Use a different flag for the port argument (e.g. `-port`)
    pub fn with_port_flag(mut self, flag: impl Into<String>) -> Self {
        self.port_flag = flag.into();
        self
    }

    fn command_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args = request.args.clone();
        args.push(self.port_flag.clone());
        args.push(request.port.to_string());
        args
    }
}

#[async_trait]
impl Runner for Subprocess {
    async fn run(&self, request: SpawnRequest) -> Result<RunningProcess> {
        let args = self.command_args(&request);
        let name = request.name;

        info!(plugin = %name, command = %request.command, ?args, "Spawning plugin process");

        let mut cmd = Command::new(&request.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|source| Error::PluginCannotStart {
            name: name.clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(Error::PluginCannotStart {
                name,
                source: std::io::Error::other("process exited before reporting a pid"),
            });
        };

        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump(err, stderr.clone()));
        }

        let (switch, kill_rx) = KillSwitch::for_process(ProcessId(pid));
        tokio::spawn(watch(name.clone(), pid, child, kill_rx));

        if !request.grace.is_zero() {
            debug!(plugin = %name, grace = ?request.grace, "Waiting for plugin startup");
            tokio::time::sleep(request.grace).await;
        }

        info!(plugin = %name, pid, "Plugin process started");

        Ok(RunningProcess {
            name,
            id: ProcessId(pid),
            kill: Some(switch),
            stdout,
            stderr,
        })
    }
}

/// Copy a child's output stream into its buffer until EOF
async fn pump<R>(mut reader: R, buffer: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.write(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Plugin output stream closed");
                break;
            }
        }
    }
}

/// Reap the child. Once the kill switch has sent SIGTERM, give it
/// [`TERMINATE_TIMEOUT`] to exit before killing it.
///
/// Wait errors are logged, never raised.
async fn watch(name: String, pid: u32, mut child: Child, kill_rx: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(plugin = %name, pid, %status, "Plugin process exited"),
            Err(e) => warn!(plugin = %name, pid, error = %e, "Error waiting for plugin process"),
        },
        Ok(()) = kill_rx => {
            reap_terminated(&name, pid, &mut child).await;
        }
    }
}

async fn reap_terminated(name: &str, pid: u32, child: &mut Child) {
    match tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(plugin = %name, pid, %status, "Plugin process terminated"),
        Ok(Err(e)) => warn!(plugin = %name, pid, error = %e, "Error waiting for plugin process"),
        Err(_) => {
            warn!(plugin = %name, pid, "Plugin ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(plugin = %name, pid, error = %e, "Failed to kill plugin process");
            }
        }
    }
}
