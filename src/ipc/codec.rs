//! Line-delimited JSON wire types for the gateway ↔ browser channel.
//!
//! Command:  `{"id":N, "method":"...", "params":{...}}\n`
//! Reply:    `{"id":N, "result":{...}}` or
//!           `{"id":N, "error":{"code":C, "message":"..."}}`
//!
//! The browser's stderr carries out-of-band JSON lines: a readiness
//! sentinel once initialization completes, and license-error objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct IpcCommand {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl IpcCommand {
    /// Serialize with the trailing newline the browser's line reader needs.
    pub fn encode(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpcWireError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpcReply {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<IpcWireError>,
}

/// Parse one stdout line. Lines that are not valid reply objects are the
/// caller's problem to count and drop — they must never block other
/// pending requests.
pub fn parse_reply(line: &str) -> Result<IpcReply, serde_json::Error> {
    serde_json::from_str(line)
}

// ─── stderr events ───────────────────────────────────────────────────────────

/// Out-of-band browser events observed on stderr.
#[derive(Debug, Clone, PartialEq)]
pub enum StderrEvent {
    /// The browser finished initialization and accepts commands.
    /// `socket_path` is advertised when the build supports multi-socket IPC.
    Ready { socket_path: Option<String> },
    LicenseError {
        status: String,
        message: String,
        fingerprint: String,
    },
    /// Anything else — diagnostics, crash spew, non-JSON noise.
    Other,
}

#[derive(Deserialize)]
struct StderrLine {
    event: Option<String>,
    socket_path: Option<String>,
    status: Option<String>,
    message: Option<String>,
    fingerprint: Option<String>,
}

pub fn parse_stderr_line(line: &str) -> StderrEvent {
    let parsed: StderrLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(_) => return StderrEvent::Other,
    };
    match parsed.event.as_deref() {
        Some("ready") => StderrEvent::Ready {
            socket_path: parsed.socket_path,
        },
        Some("license_error") => StderrEvent::LicenseError {
            status: parsed.status.unwrap_or_else(|| "unknown".to_string()),
            message: parsed.message.unwrap_or_default(),
            fingerprint: parsed.fingerprint.unwrap_or_default(),
        },
        _ => StderrEvent::Other,
    }
}
