//! Process Registry
//!
//! Lock-guarded table of running plugin processes, keyed by plugin name.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::RunningProcess;
use crate::error::{Error, Result};

/// Name → running process table.
///
/// One exclusive lock covers the whole table; plugin counts are small enough
/// that contention does not matter.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<String, RunningProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a process under `name`, refusing to replace a live entry
    pub fn register(&self, name: &str, process: RunningProcess) -> Result<()> {
        let mut processes = self.processes.lock();
        if processes.contains_key(name) {
            return Err(Error::PluginAlreadyStarted(name.to_string()));
        }
        processes.insert(name.to_string(), process);
        Ok(())
    }

    /// Fetch a copy of the entry for `name`
    pub fn get(&self, name: &str) -> Result<RunningProcess> {
        self.processes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.processes.lock().contains_key(name)
    }

    /// Remove `name`, returning the entry if there was one
    pub fn delete(&self, name: &str) -> Option<RunningProcess> {
        self.processes.lock().remove(name)
    }

    /// Drop every entry
    pub fn reset_all(&self) {
        self.processes.lock().clear();
    }

    /// Names of all registered processes, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }
}
