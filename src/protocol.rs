//! Worker Message Protocol
//!
//! Messages a worker process emits while it runs a job. Each message travels
//! as one JSON line on the worker's stdout, wrapped in a versioned envelope:
//!
//! ```json
//! {"v":1,"message":{"kind":"progress","index":1,"total":4}}
//! ```
//!
//! Fields are primitives only. `Complete` or `Error` is always the final
//! message of a run.

use serde::{Deserialize, Serialize};

/// Current envelope version
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Message has no protocol version")]
    MissingVersion,
    #[error("Unsupported protocol version {found} (expected {expected})")]
    VersionMismatch { expected: u32, found: u64 },
}

/// Severity of a user-visible log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.pad(label)
    }
}

/// A single worker-to-supervisor message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionMessage {
    /// `index` of `total` steps are done
    Progress { index: usize, total: usize },
    Log { level: LogLevel, message: String },
    /// One job (a subject or an import item) finished
    JobComplete {
        index: usize,
        success: bool,
        message: String,
    },
    /// The run ended normally
    Complete {
        success_count: usize,
        error_count: usize,
    },
    /// The run ended with a fatal error
    Error { message: String },
}

impl ExecutionMessage {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        ExecutionMessage::Log {
            level,
            message: message.into(),
        }
    }

    /// `Complete` and `Error` end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionMessage::Complete { .. } | ExecutionMessage::Error { .. }
        )
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    v: u32,
    message: &'a ExecutionMessage,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    message: ExecutionMessage,
}

/// Serialize a message as one JSON line (no trailing newline)
pub fn encode(message: &ExecutionMessage) -> Result<String, ProtocolError> {
    let envelope = OutgoingEnvelope {
        v: PROTOCOL_VERSION,
        message,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse one JSON line, rejecting envelopes from another protocol version
pub fn decode(line: &str) -> Result<ExecutionMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line.trim())?;
    let found = value
        .get("v")
        .and_then(serde_json::Value::as_u64)
        .ok_or(ProtocolError::MissingVersion)?;
    if found != u64::from(PROTOCOL_VERSION) {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found,
        });
    }
    let envelope: IncomingEnvelope = serde_json::from_value(value)?;
    Ok(envelope.message)
}

/// Destination for messages produced while a job runs
pub trait MessageSink: Send + Sync {
    fn send(&self, message: ExecutionMessage);

    fn log(&self, level: LogLevel, message: &str) {
        self.send(ExecutionMessage::log(level, message));
    }

    /// Set once the run has been asked to stop; jobs check it between steps
    fn is_cancelled(&self) -> bool {
        false
    }
}
