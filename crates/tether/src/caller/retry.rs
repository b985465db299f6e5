//! Retry Policy
//!
//! Plugins restart underneath their callers, so most call failures are
//! transient. [`RetryCaller`] keeps re-issuing a call until it succeeds or
//! fails with a terminal error kind.
//!
//! With the default policy there is no attempt ceiling: a plugin that never
//! comes back blocks the calling task forever. Set
//! [`RetryPolicy::max_attempts`] or wrap the call in a timeout when that is not
//! acceptable.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::Caller;
use crate::error::{Error, ErrorKind, Result};

/// Default pause between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

// ─────────────────────────────────────────────────────────────────────────────
// Terminal Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error kinds that are returned to the caller without retrying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalErrors(HashSet<ErrorKind>);

impl Default for TerminalErrors {
    /// Protocol-level ping/exec failures and generic call failures
    fn default() -> Self {
        Self::new([
            ErrorKind::PluginPing,
            ErrorKind::PluginExec,
            ErrorKind::PluginCall,
        ])
    }
}

impl TerminalErrors {
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self(kinds.into_iter().collect())
    }

    /// Retry everything
    pub fn none() -> Self {
        Self(HashSet::new())
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0.contains(&kind)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Policy
// ─────────────────────────────────────────────────────────────────────────────

/// How a [`RetryCaller`] reacts to failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Fixed pause before each retry
    pub interval: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    pub terminal: TerminalErrors,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
            terminal: TerminalErrors::default(),
        }
    }
}

impl RetryPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_terminal(mut self, terminal: TerminalErrors) -> Self {
        self.terminal = terminal;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Caller
// ─────────────────────────────────────────────────────────────────────────────

/// [`Caller`] that retries its inner caller according to a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryCaller {
    inner: Arc<dyn Caller>,
    policy: RetryPolicy,
}

impl RetryCaller {
    pub fn new(inner: Arc<dyn Caller>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);

            let e = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if self.policy.terminal.contains(e.kind()) {
                return Err(e);
            }

            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }

            warn!(
                operation,
                attempt,
                error = %e,
                retry_in = ?self.policy.interval,
                "Plugin call failed, retrying"
            );
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}

#[async_trait]
impl Caller for RetryCaller {
    async fn ping(&self) -> Result<String> {
        self.retry("ping", || self.inner.ping()).await
    }

    async fn exec(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.retry("exec", || self.inner.exec(command, payload)).await
    }
}
