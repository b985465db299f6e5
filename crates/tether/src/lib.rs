//! Tether - Supervised Subprocess Plugin Host
//!
//! Runs plugins as separate OS processes, talks to them over REST or RPC and
//! restarts them when they die.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────────┐
//! │ PluginConfig │──▶│  Installer   │──▶│  Executor / Container        │
//! │  (TOML)      │   │ exists + md5 │   │  run ─▶ ProcessInstance      │
//! └──────────────┘   └──────────────┘   │  get ─▶ Plugin (RetryCaller) │
//!                                       └──────────────┬───────────────┘
//!                                                      │
//!                        ┌─────────────────────────────┴──┐
//!                        │ Supervisor: probe ─▶ handlers  │
//!                        │             (AutoRestart)      │
//!                        └────────────────────────────────┘
//! ```

pub mod caller;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod process;
pub mod registry;
pub mod supervisor;

pub use caller::{
    Caller, CallerFactory, Plugin, ProtocolOptions, ProtocolType, RestOptions, RetryPolicy,
    RpcClient, RpcConnector, RpcOptions, build_protocol,
};
pub use config::PluginConfig;
pub use error::{Error, ErrorKind, Result};
pub use executor::{Container, Executor, ExecutorOptions};
pub use host::{IdentityChecker, Installer, Md5Checker, PluginMeta, Plugins, Sha256Checker};
pub use process::{ProcessId, ProcessInstance, Subprocess};
pub use registry::{Host, HostPlugins, PluginConf, Registry};
pub use supervisor::{FnHandler, Liveness, LivenessProbe, Signal, SignalHandler, Supervisor};
