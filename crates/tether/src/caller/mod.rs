//! Plugin Callers
//!
//! A [`Caller`] talks to one running plugin. Two transports exist:
//! - [`RestCaller`]: JSON over HTTP
//! - [`RpcCaller`]: any RPC stack behind the [`RpcClient`] trait
//!
//! [`RetryCaller`] wraps either one with the transient-error retry policy, and
//! [`Plugin`] is the handle applications hold.

pub mod rest;
pub mod retry;
pub mod rpc;

pub use rest::{RestCaller, RestOptions};
pub use retry::{RetryCaller, RetryPolicy, TerminalErrors};
pub use rpc::{RpcCaller, RpcClient, RpcConnector, RpcOptions, RpcReply};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::PluginMeta;

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Type
// ─────────────────────────────────────────────────────────────────────────────

/// Wire protocol a plugin speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Rest,
    Grpc,
}

impl ProtocolType {
    /// Every protocol tether can call
    pub const SUPPORTED: [ProtocolType; 2] = [ProtocolType::Rest, ProtocolType::Grpc];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Rest => "rest",
            ProtocolType::Grpc => "grpc",
        }
    }
}

impl FromStr for ProtocolType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::ProtocolUnknown(s.to_string()))
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Caller
// ─────────────────────────────────────────────────────────────────────────────

/// The two operations every plugin exposes
#[async_trait]
pub trait Caller: Send + Sync {
    /// Liveness check; plugins answer `pong`
    async fn ping(&self) -> Result<String>;

    /// Run a named command with an opaque payload
    async fn exec(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Builds a transport-bound caller for a protocol and port.
///
/// Returns `None` when the protocol has no transport configured.
pub type CallerFactory = Arc<dyn Fn(ProtocolType, u16) -> Option<Arc<dyn Caller>> + Send + Sync>;

/// Per-plugin transport settings; only the plugin's own protocol is consulted
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    pub rest: Option<RestOptions>,
    pub rpc: Option<RpcOptions>,
}

impl ProtocolOptions {
    pub fn rest(options: RestOptions) -> Self {
        Self {
            rest: Some(options),
            rpc: None,
        }
    }

    pub fn rpc(options: RpcOptions) -> Self {
        Self {
            rest: None,
            rpc: Some(options),
        }
    }

    /// Port configured for the given protocol
    pub fn port(&self, protocol: ProtocolType) -> Option<u16> {
        match protocol {
            ProtocolType::Rest => self.rest.as_ref().map(|o| o.port),
            ProtocolType::Grpc => self.rpc.as_ref().map(|o| o.port),
        }
    }
}

/// Default [`CallerFactory`] for a set of protocol options.
///
/// `None` when neither transport is configured.
pub fn build_protocol(options: &ProtocolOptions) -> Option<CallerFactory> {
    if options.rest.is_none() && options.rpc.is_none() {
        return None;
    }

    let options = options.clone();
    Some(Arc::new(move |protocol: ProtocolType, port: u16| match protocol {
        ProtocolType::Rest => options.rest.as_ref().map(|rest| {
            let rest = RestOptions {
                port,
                ..rest.clone()
            };
            Arc::new(RestCaller::new(&rest)) as Arc<dyn Caller>
        }),
        ProtocolType::Grpc => options
            .rpc
            .as_ref()
            .map(|rpc| Arc::new(RpcCaller::new(port, rpc.connector.clone())) as Arc<dyn Caller>),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Handle
// ─────────────────────────────────────────────────────────────────────────────

/// A callable plugin: its installed metadata plus a retrying transport
pub struct Plugin {
    name: String,
    meta: Arc<PluginMeta>,
    protocol: ProtocolType,
    caller: RetryCaller,
}

impl Plugin {
    pub fn new(
        name: impl Into<String>,
        meta: Arc<PluginMeta>,
        protocol: ProtocolType,
        caller: RetryCaller,
    ) -> Self {
        Self {
            name: name.into(),
            meta,
            protocol,
            caller,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub async fn ping(&self) -> Result<String> {
        self.caller.ping().await
    }

    pub async fn exec(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.caller.exec(command, payload).await
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}
