//! REST Transport
//!
//! JSON over HTTP. Plugins answer `GET /ping` with `200` and
//! `POST /exec` with `202`, wrapping results in a status/data envelope:
//!
//! ```json
//! { "status": "success", "data": { "response": "pong" } }
//! ```
//!
//! Exec payloads and responses travel hex-encoded.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::Caller;
use crate::error::{Error, Result};

pub const PATH_PING: &str = "/ping";
pub const PATH_EXEC: &str = "/exec";

/// Per-request timeout when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheme used for addresses given without one
pub const DEFAULT_SCHEME: &str = "http://";

const STATUS_OK: u16 = 200;
const STATUS_ACCEPTED: u16 = 202;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Envelope around every plugin response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JsonResponse {
    pub fn success(response: impl Into<Value>) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(JsonData {
                response: response.into(),
            }),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonData {
    pub response: Value,
}

/// Body of `POST /exec`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    /// Hex-encoded payload bytes
    pub payload: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestOptions {
    /// Host address, with or without scheme
    pub addr: String,
    pub port: u16,
    pub timeout: Duration,
}

impl RestOptions {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Zero falls back to [`DEFAULT_TIMEOUT`]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// `scheme://addr:port`
    pub fn base_url(&self) -> String {
        let addr = self.addr.trim_end_matches('/');
        if addr.contains("://") {
            format!("{addr}:{}", self.port)
        } else {
            format!("{DEFAULT_SCHEME}{addr}:{}", self.port)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST Caller
// ─────────────────────────────────────────────────────────────────────────────

/// [`Caller`] speaking the REST wire contract.
///
/// Requests are blocking `ureq` calls moved onto tokio's blocking pool.
#[derive(Clone)]
pub struct RestCaller {
    base: String,
    agent: ureq::Agent,
}

impl RestCaller {
    pub fn new(options: &RestOptions) -> Self {
        let timeout = if options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            options.timeout
        };

        Self {
            base: options.base_url(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn send(&self, path: &'static str, body: Option<ExecRequest>) -> Result<(u16, String)> {
        let url = format!("{}{}", self.base, path);
        let agent = self.agent.clone();

        trace!(%url, "Plugin REST request");

        tokio::task::spawn_blocking(move || {
            let response = match body {
                Some(body) => agent
                    .post(&url)
                    .set("Content-Type", "application/json")
                    .send_json(&body),
                None => agent.get(&url).set("Accept", "application/json").call(),
            };

            let response = match response {
                Ok(response) => response,
                Err(ureq::Error::Status(_, response)) => response,
                Err(ureq::Error::Transport(err)) => {
                    return Err(Error::RestRequest(format!("{url}: {err}")));
                }
            };

            let status = response.status();
            let text = response
                .into_string()
                .map_err(|e| Error::PluginCall(format!("read response body: {e}")))?;
            Ok((status, text))
        })
        .await
        .map_err(|e| Error::RestRequest(format!("request task failed: {e}")))?
    }
}

fn parse_envelope(body: &str) -> Result<Value> {
    let envelope: JsonResponse =
        serde_json::from_str(body).map_err(|e| Error::PluginCall(e.to_string()))?;

    envelope
        .data
        .map(|data| data.response)
        .ok_or_else(|| Error::PluginCall(format!("response without data (status {})", envelope.status)))
}

#[async_trait]
impl Caller for RestCaller {
    async fn ping(&self) -> Result<String> {
        let (status, body) = self.send(PATH_PING, None).await?;
        if status != STATUS_OK {
            return Err(Error::PluginPing(status));
        }

        match parse_envelope(&body)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    async fn exec(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let request = ExecRequest {
            command: command.to_string(),
            payload: hex::encode(payload),
        };

        let (status, body) = self.send(PATH_EXEC, Some(request)).await?;
        if status != STATUS_ACCEPTED {
            return Err(Error::PluginExec(status));
        }

        match parse_envelope(&body)? {
            Value::String(s) => hex::decode(&s).map_err(|e| Error::Decode(e.to_string())),
            other => Err(Error::Decode(format!("expected hex string, got {other}"))),
        }
    }
}
