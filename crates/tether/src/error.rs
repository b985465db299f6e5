//! Error types shared by every tether component.
//!
//! Each variant maps onto an [`ErrorKind`], which is what the retry policy in
//! [`crate::caller::RetryCaller`] inspects when deciding whether a failure is
//! terminal.

use std::fmt;
use std::path::PathBuf;

/// Boxed error used at the seams where third-party transports plug in.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, Error>;

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors produced while installing, running and calling plugins
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Authorization
    #[error("No hosts available: {0}")]
    NoHosts(String),

    #[error("Cannot install empty plugins")]
    EmptyPlugins,

    #[error("No plugins available")]
    NoPluginsAvailable,

    #[error("Failed to set up hosts: {}", format_failures(.0))]
    SetupFailed(Vec<(String, Error)>),

    // Lookup
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("No connection settings for plugin: {0}")]
    PluginConfNotFound(String),

    // Process
    #[error("Plugin cannot start: {name}: {source}")]
    PluginCannotStart {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin has been started: {0}")]
    PluginAlreadyStarted(String),

    #[error("Plugin cannot be killed: {0}")]
    PluginCannotBeKilled(String),

    // Protocol
    #[error("Plugin cannot be called (status {0})")]
    PluginPing(u16),

    #[error("Plugin cannot exec (status {0})")]
    PluginExec(u16),

    #[error("Plugin communication error: {0}")]
    PluginCall(String),

    #[error("Illegal protocol: {0}")]
    ProtocolUnknown(String),

    #[error("Error request rest connection: {0}")]
    RestRequest(String),

    #[error("Error rpc connection: {0}")]
    RpcConnection(String),

    #[error("Error rpc response: {0}")]
    RpcResponse(String),

    #[error("Cannot decode plugin response: {0}")]
    Decode(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    // Configuration
    #[error("Config file not found")]
    ConfigNotFound,

    #[error("Cannot read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseConfig(#[from] toml::de::Error),
}

fn format_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(host, e)| format!("{host}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// The payload-free kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoHosts(_) => ErrorKind::NoHosts,
            Error::EmptyPlugins => ErrorKind::EmptyPlugins,
            Error::NoPluginsAvailable => ErrorKind::NoPluginsAvailable,
            Error::SetupFailed(_) => ErrorKind::SetupFailed,
            Error::PluginNotFound(_) => ErrorKind::PluginNotFound,
            Error::PluginConfNotFound(_) => ErrorKind::PluginConfNotFound,
            Error::PluginCannotStart { .. } => ErrorKind::PluginCannotStart,
            Error::PluginAlreadyStarted(_) => ErrorKind::PluginAlreadyStarted,
            Error::PluginCannotBeKilled(_) => ErrorKind::PluginCannotBeKilled,
            Error::PluginPing(_) => ErrorKind::PluginPing,
            Error::PluginExec(_) => ErrorKind::PluginExec,
            Error::PluginCall(_) => ErrorKind::PluginCall,
            Error::ProtocolUnknown(_) => ErrorKind::ProtocolUnknown,
            Error::RestRequest(_) => ErrorKind::RestRequest,
            Error::RpcConnection(_) => ErrorKind::RpcConnection,
            Error::RpcResponse(_) => ErrorKind::RpcResponse,
            Error::Decode(_) => ErrorKind::Decode,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Error::ConfigNotFound => ErrorKind::ConfigNotFound,
            Error::ReadConfig { .. } => ErrorKind::ReadConfig,
            Error::ParseConfig(_) => ErrorKind::ParseConfig,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Kind
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminant of [`Error`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoHosts,
    EmptyPlugins,
    NoPluginsAvailable,
    SetupFailed,
    PluginNotFound,
    PluginConfNotFound,
    PluginCannotStart,
    PluginAlreadyStarted,
    PluginCannotBeKilled,
    PluginPing,
    PluginExec,
    PluginCall,
    ProtocolUnknown,
    RestRequest,
    RpcConnection,
    RpcResponse,
    Decode,
    RetriesExhausted,
    ConfigNotFound,
    ReadConfig,
    ParseConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
