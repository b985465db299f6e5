//! Plugin Processes
//!
//! Everything needed to keep track of plugin subprocesses:
//! - [`ProcessRegistry`]: name → running process bookkeeping
//! - [`Subprocess`]: the default [`Runner`], spawning real OS processes
//! - [`ProcessInstance`]: runner + registry with start/kill guarantees

mod instance;
mod registry;
mod runner;

pub use instance::*;
pub use registry::*;
pub use runner::*;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Process Identity
// ─────────────────────────────────────────────────────────────────────────────

/// OS process identifier of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output Buffer
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes of output kept per stream
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Byte buffer shared between the output pump task and readers.
///
/// Keeps only the most recent `limit` bytes.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_OUTPUT_LIMIT)
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    /// Append bytes, dropping the oldest ones past the limit
    pub fn write(&self, bytes: &[u8]) {
        let mut buf = self.bytes.lock();
        buf.extend_from_slice(bytes);
        if buf.len() > self.limit {
            let excess = buf.len() - self.limit;
            buf.drain(..excess);
        }
    }

    /// Copy of the retained output
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Retained output decoded lossily as UTF-8
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kill Switch
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot request to terminate a running plugin.
///
/// Cloneable; only the first [`KillSwitch::trigger`] has an effect. It sends
/// SIGTERM to the process (when it has one) and notifies the watcher, which
/// reaps the child and escalates to SIGKILL. It never waits for the exit.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    pid: Option<ProcessId>,
}

impl KillSwitch {
    /// A switch that only notifies its receiver
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        Self::build(None)
    }

    /// A switch that signals `pid` before notifying the process watcher
    pub fn for_process(pid: ProcessId) -> (Self, oneshot::Receiver<()>) {
        Self::build(Some(pid))
    }

    fn build(pid: Option<ProcessId>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let switch = Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            pid,
        };
        (switch, rx)
    }

    /// Terminate the process.
    ///
    /// `Ok(false)` when the switch was already used or the process exited on
    /// its own; `Err` when SIGTERM could not be delivered.
    pub fn trigger(&self) -> std::result::Result<bool, Errno> {
        let Some(tx) = self.tx.lock().take() else {
            return Ok(false);
        };
        // Watcher gone: the child was reaped and its pid may be reused
        if tx.is_closed() {
            return Ok(false);
        }

        if let Some(pid) = self.pid {
            let raw = i32::try_from(pid.0).map_err(|_| Errno::EINVAL)?;
            if raw <= 0 {
                return Err(Errno::EINVAL);
            }
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(false),
                Err(errno) => return Err(errno),
            }
        }

        Ok(tx.send(()).is_ok())
    }

    /// Whether [`KillSwitch::trigger`] has already been called
    pub fn is_spent(&self) -> bool {
        self.tx.lock().is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Running Process
// ─────────────────────────────────────────────────────────────────────────────

/// A started plugin process
#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub name: String,
    pub id: ProcessId,
    /// `None` for entries that were registered without a live child
    pub kill: Option<KillSwitch>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
}

impl RunningProcess {
    /// A record without a kill switch or captured output
    pub fn detached(name: impl Into<String>, id: ProcessId) -> Self {
        Self {
            name: name.into(),
            id,
            kill: None,
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// What a [`Runner`] needs to start one plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    /// Time to wait after spawning before handing the process back
    pub grace: Duration,
}

/// Starts plugin processes
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Spawn the plugin described by `request`.
    ///
    /// Resolves once the process is alive and the grace period has elapsed.
    async fn run(&self, request: SpawnRequest) -> Result<RunningProcess>;
}
