//! RPC Transport
//!
//! tether does not ship an RPC stack. Applications plug one in by implementing
//! [`RpcClient`] and handing over an [`RpcConnector`] that dials a plugin port.
//! A fresh connection is requested for every call.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::Caller;
use crate::error::{BoxError, Error, Result};

/// Status string of a successful reply
pub const STATUS_SUCCESS: &str = "success";

/// Reply of an RPC plugin call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply<T> {
    pub status: String,
    pub response: T,
}

impl<T> RpcReply<T> {
    pub fn success(response: T) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            response,
        }
    }
}

/// Client side of the plugin RPC service
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn ping(&self) -> std::result::Result<RpcReply<String>, BoxError>;

    async fn exec(
        &self,
        command: &str,
        payload: &[u8],
    ) -> std::result::Result<RpcReply<Vec<u8>>, BoxError>;
}

/// Dials the plugin listening on the given port
pub type RpcConnector =
    Arc<dyn Fn(u16) -> std::result::Result<Arc<dyn RpcClient>, BoxError> + Send + Sync>;

/// Connection settings for RPC plugins
#[derive(Clone)]
pub struct RpcOptions {
    pub port: u16,
    pub connector: RpcConnector,
}

impl RpcOptions {
    pub fn new(port: u16, connector: RpcConnector) -> Self {
        Self { port, connector }
    }
}

impl fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcOptions")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// [`Caller`] over an [`RpcClient`]
#[derive(Clone)]
pub struct RpcCaller {
    port: u16,
    connector: RpcConnector,
}

impl RpcCaller {
    pub fn new(port: u16, connector: RpcConnector) -> Self {
        Self { port, connector }
    }

    fn connect(&self) -> Result<Arc<dyn RpcClient>> {
        (self.connector)(self.port)
            .map_err(|e| Error::RpcConnection(format!("port {}: {e}", self.port)))
    }
}

fn check<T>(reply: RpcReply<T>) -> Result<T> {
    if reply.status == STATUS_SUCCESS {
        Ok(reply.response)
    } else {
        Err(Error::RpcResponse(format!("status {}", reply.status)))
    }
}

#[async_trait]
impl Caller for RpcCaller {
    async fn ping(&self) -> Result<String> {
        let client = self.connect()?;
        let reply = client
            .ping()
            .await
            .map_err(|e| Error::RpcResponse(e.to_string()))?;
        check(reply)
    }

    async fn exec(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let client = self.connect()?;
        let reply = client
            .exec(command, payload)
            .await
            .map_err(|e| Error::RpcResponse(e.to_string()))?;
        check(reply)
    }
}
