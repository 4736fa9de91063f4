//! Message protocol shared by the host and the isolated runtime.
//!
//! There are two layers:
//! - [`CodeExecutionMessage`]: the closed, per-execution message union that
//!   callers observe. Every variant carries a timestamp.
//! - [`HostCommand`] / [`RuntimeEvent`]: the envelopes exchanged with the
//!   runtime process. Each envelope travels as one line of the form
//!   `data: <base64(json)>\n`, so arbitrary payloads never break framing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix that marks a protocol line. Anything else on the stream is noise.
pub const FRAME_PREFIX: &str = "data: ";

/// Wall-clock timestamp in epoch milliseconds.
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// -----------------------------------------------------------------------------
// Public message union
// -----------------------------------------------------------------------------

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// The script is about to be invoked.
    Running,
    /// The script finished normally.
    Completed,
    /// The script (or the sandbox running it) failed.
    Failed,
}

impl ExecutionStatus {
    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single test case in test mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The case is about to run.
    Running,
    /// The case completed without throwing.
    Passed,
    /// The case threw.
    Failed,
    /// The case was not run.
    Skipped,
}

/// Console method a log line came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.log` and friends.
    #[default]
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
    /// `console.debug` / `console.trace`
    Debug,
}

/// Details of a thrown `Error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error class name, e.g. `TypeError`.
    #[serde(default)]
    pub name: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Stack trace as reported by the runtime.
    #[serde(default)]
    pub stack: String,
}

/// A thrown value: either a plain string or a structured error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExceptionPayload {
    /// Non-`Error` throwables, stringified.
    Message(String),
    /// A real `Error` object.
    Error(ErrorDetails),
}

impl ExceptionPayload {
    /// Builds a structured payload.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        Self::Error(ErrorDetails {
            stack: format!("{name}: {message}"),
            name,
            message,
        })
    }

    /// The human-readable message of the thrown value.
    pub fn message(&self) -> &str {
        match self {
            Self::Message(text) => text,
            Self::Error(details) => &details.message,
        }
    }
}

impl std::fmt::Display for ExceptionPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(text) => write!(f, "{text}"),
            Self::Error(details) if details.name.is_empty() => write!(f, "{}", details.message),
            Self::Error(details) => write!(f, "{}: {}", details.name, details.message),
        }
    }
}

/// One event of an execution, in the order the runtime emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CodeExecutionMessage {
    /// A captured console line.
    Log {
        /// Formatted console output.
        text: String,
        /// Console method used.
        #[serde(default)]
        level: LogLevel,
        /// Emission time.
        timestamp: Timestamp,
    },
    /// A thrown value that escaped the script.
    Exception {
        /// The thrown value.
        exception: ExceptionPayload,
        /// Emission time.
        timestamp: Timestamp,
    },
    /// A status transition.
    Status {
        /// New status.
        status: ExecutionStatus,
        /// Failure reason for `failed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Emission time.
        timestamp: Timestamp,
    },
    /// The JSON value the script resolved to.
    Result {
        /// The returned value.
        result: Value,
        /// Emission time.
        timestamp: Timestamp,
    },
    /// A test-case event (test mode only).
    Test {
        /// Case status.
        status: TestStatus,
        /// Case description.
        name: String,
        /// Human-readable note.
        #[serde(default)]
        message: String,
        /// Emission time.
        #[serde(rename = "eventTimestamp")]
        event_timestamp: Timestamp,
        /// Elapsed milliseconds, `-1` when the case was not timed.
        duration: i64,
    },
}

impl CodeExecutionMessage {
    /// A `failed` status stamped with `timestamp`.
    pub fn failed(error: impl Into<String>, timestamp: Timestamp) -> Self {
        Self::Status {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
            timestamp,
        }
    }

    /// The message's timestamp (`eventTimestamp` for test events).
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Log { timestamp, .. }
            | Self::Exception { timestamp, .. }
            | Self::Status { timestamp, .. }
            | Self::Result { timestamp, .. } => *timestamp,
            Self::Test {
                event_timestamp, ..
            } => *event_timestamp,
        }
    }

    /// Raises the message's timestamp to at least `floor`.
    pub fn clamp_timestamp(&mut self, floor: Timestamp) {
        let timestamp = match self {
            Self::Log { timestamp, .. }
            | Self::Exception { timestamp, .. }
            | Self::Status { timestamp, .. }
            | Self::Result { timestamp, .. } => timestamp,
            Self::Test {
                event_timestamp, ..
            } => event_timestamp,
        };
        *timestamp = (*timestamp).max(floor);
    }

    /// The terminal status carried by this message, if any.
    pub fn terminal_status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::Status { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }

    /// Returns true for `completed` / `failed` status messages.
    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }
}

// -----------------------------------------------------------------------------
// Wire envelopes
// -----------------------------------------------------------------------------

/// Commands written to the runtime's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostCommand {
    /// Start one job. The worker module has already been written to disk.
    Job {
        /// Job identifier echoed on every event.
        #[serde(rename = "jobId")]
        job_id: String,
        /// Directory the job may read and write.
        #[serde(rename = "jobDir")]
        job_dir: String,
        /// Entry module of the job's worker realm.
        #[serde(rename = "workerFile")]
        worker_file: String,
        /// Positional arguments, when sent inline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<Value>>,
        /// Spill file (relative to the ipc directory) holding the arguments.
        #[serde(
            rename = "argsFile",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        args_file: Option<String>,
    },
    /// Ask the runtime to exit.
    Shutdown,
}

/// Events read from the runtime's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    /// Boot signal: the runtime is accepting jobs.
    Ready {
        /// Runtime version string.
        #[serde(default)]
        version: String,
    },
    /// A message belonging to one job.
    Job {
        /// Job the message belongs to.
        #[serde(rename = "jobId")]
        job_id: String,
        /// The message itself.
        message: CodeExecutionMessage,
    },
    /// A result too large for the pipe, written to the ipc directory.
    SpilledResult {
        /// Job the result belongs to.
        #[serde(rename = "jobId")]
        job_id: String,
        /// File name relative to the ipc directory.
        file: String,
        /// Emission time of the original result.
        timestamp: Timestamp,
    },
}

/// Errors decoding a protocol line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload was not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload was not valid UTF-8.
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The JSON did not match the expected envelope.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes an envelope as one newline-terminated protocol line.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    Ok(format!("{FRAME_PREFIX}{}\n", STANDARD.encode(json)))
}

/// Decodes one protocol line.
///
/// Returns `Ok(None)` for lines that are not protocol frames (blank lines,
/// stray runtime output).
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<Option<T>, ProtocolError> {
    let Some(payload) = line.trim_end().strip_prefix(FRAME_PREFIX) else {
        return Ok(None);
    };
    let bytes = STANDARD.decode(payload.trim())?;
    let json = String::from_utf8(bytes)?;
    Ok(Some(serde_json::from_str(&json)?))
}
