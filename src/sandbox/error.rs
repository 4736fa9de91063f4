//! Domain-specific error types for sandbox operations.
//!
//! Only manager-lifecycle problems are errors. Script-level failures
//! (syntax errors, exceptions, timeouts, crashes) are reported as data in
//! the execution's message stream.

use std::time::Duration;

use crate::protocol::ProtocolError;

/// Errors that can occur while managing sandbox instances.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// No instance signalled readiness within the boot budget.
    #[error("Sandbox did not become ready within {timeout_ms} ms")]
    BootTimeout {
        /// The boot budget that ran out.
        timeout_ms: u64,
    },

    /// Every instance stopped without ever becoming ready.
    #[error("Sandbox runtime is unavailable: {message}")]
    RuntimeUnavailable {
        /// Why each instance stopped.
        message: String,
    },

    /// The runtime process could not be started.
    #[error("Failed to launch sandbox runtime '{program}': {message}")]
    Launch {
        /// The runtime executable.
        program: String,
        /// The OS error.
        message: String,
    },

    /// Writing to or reading from the runtime process failed.
    #[error("Sandbox transport failed: {message}")]
    Transport {
        /// What went wrong on the pipe.
        message: String,
    },

    /// The runtime sent something that is not a valid protocol frame.
    #[error("Sandbox protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The manager has been shut down.
    #[error("Sandbox manager has been shut down")]
    ShutDown,

    /// Filesystem operation on the work directory failed.
    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be encoded or decoded as JSON.
    #[error("Sandbox payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration is unusable.
    #[error("Invalid sandbox configuration: {message}")]
    Config {
        /// The offending setting.
        message: String,
    },
}

impl SandboxError {
    /// Creates a `BootTimeout` error from a `Duration`.
    pub fn boot_timeout(duration: Duration) -> Self {
        Self::BootTimeout {
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `RuntimeUnavailable` error.
    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `Launch` error.
    pub fn launch(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Creates a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a boot timeout.
    pub fn is_boot_timeout(&self) -> bool {
        matches!(self, Self::BootTimeout { .. })
    }

    /// Returns true if the runtime could never be brought up.
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable { .. } | Self::Launch { .. })
    }

    /// Returns true if the manager was shut down.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}
