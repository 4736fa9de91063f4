//! Buffered collection of one execution's message stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::protocol::{
    now_millis, CodeExecutionMessage, ExceptionPayload, ExecutionStatus, LogLevel, TestStatus,
};

/// Failure reason used when a stream ends without a terminal status.
pub fn dropped_reason() -> String {
    "Sandbox dropped the execution without a terminal status".to_string()
}

/// Everything one execution produced, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Every message, ending with the terminal status.
    pub messages: Vec<CodeExecutionMessage>,
    /// Present only when the execution completed with a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A test-case event, borrowed from an [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestEvent<'a> {
    /// Case description.
    pub name: &'a str,
    /// Final status of the case.
    pub status: TestStatus,
    /// Failure message or note.
    pub message: &'a str,
    /// Elapsed milliseconds, `-1` when not timed.
    pub duration: i64,
}

impl ExecutionResult {
    /// The terminal status of the execution.
    pub fn status(&self) -> ExecutionStatus {
        self.messages
            .iter()
            .rev()
            .find_map(CodeExecutionMessage::terminal_status)
            .unwrap_or(ExecutionStatus::Failed)
    }

    /// True when the execution ended with `completed`.
    pub fn is_completed(&self) -> bool {
        self.status() == ExecutionStatus::Completed
    }

    /// The failure reason carried by the terminal status, if any.
    pub fn error(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            CodeExecutionMessage::Status {
                status: ExecutionStatus::Failed,
                error,
                ..
            } => error.as_deref(),
            _ => None,
        })
    }

    /// Captured console lines, in order.
    pub fn logs(&self) -> Vec<(LogLevel, &str)> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                CodeExecutionMessage::Log { text, level, .. } => Some((*level, text.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Every exception the script raised.
    pub fn exceptions(&self) -> Vec<&ExceptionPayload> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                CodeExecutionMessage::Exception { exception, .. } => Some(exception),
                _ => None,
            })
            .collect()
    }

    /// Test-case events, in registration order.
    pub fn tests(&self) -> Vec<TestEvent<'_>> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                CodeExecutionMessage::Test {
                    status,
                    name,
                    message,
                    duration,
                    ..
                } => Some(TestEvent {
                    name,
                    status: *status,
                    message,
                    duration: *duration,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Accumulates messages for exactly one in-flight request.
///
/// Messages are kept strictly in arrival order. The collector is finished the
/// moment a terminal status is pushed; later messages are discarded.
#[derive(Debug, Default)]
pub struct BufferedCollector {
    messages: Vec<CodeExecutionMessage>,
    result: Option<Value>,
    terminal: Option<ExecutionStatus>,
}

impl BufferedCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one message. Returns true once a terminal status has been seen.
    pub fn push(&mut self, message: CodeExecutionMessage) -> bool {
        if self.terminal.is_some() {
            debug!(?message, "discarding message after terminal status");
            return true;
        }

        if let CodeExecutionMessage::Result { result, .. } = &message {
            self.result = Some(result.clone());
        }
        self.terminal = message.terminal_status();
        self.messages.push(message);
        self.terminal.is_some()
    }

    /// True once the terminal status has been seen.
    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }

    /// Finalizes the buffer.
    ///
    /// A buffer without a terminal status gets a synthesized `failed` one. The
    /// result is kept only when the execution completed.
    pub fn finish(mut self) -> ExecutionResult {
        if self.terminal.is_none() {
            let last = self
                .messages
                .last()
                .map_or(i64::MIN, CodeExecutionMessage::timestamp);
            self.messages.push(CodeExecutionMessage::failed(
                dropped_reason(),
                now_millis().max(last),
            ));
            self.terminal = Some(ExecutionStatus::Failed);
        }

        let result = match self.terminal {
            Some(ExecutionStatus::Completed) => self.result,
            _ => None,
        };

        ExecutionResult {
            messages: self.messages,
            result,
        }
    }
}
