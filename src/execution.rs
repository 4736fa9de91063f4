//! Execution requests and the live message stream of one execution.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::collector::{dropped_reason, BufferedCollector, ExecutionResult};
use crate::protocol::{now_millis, CodeExecutionMessage, Timestamp};

/// How the runtime treats the script.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    /// Call the module's exported function with positional arguments.
    Function {
        /// Positional arguments, passed as JSON.
        args: Vec<Value>,
    },
    /// Evaluate the module for its side effects.
    Module,
    /// Evaluate the module, then run the registered test cases.
    Tests,
}

impl ExecutionMode {
    /// Name of the mode as understood by the runtime bootstrap.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function { .. } => "function",
            Self::Module => "module",
            Self::Tests => "tests",
        }
    }
}

/// One script execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Module source.
    pub script: String,
    /// What to do with the module once loaded.
    pub mode: ExecutionMode,
    /// Re-emit `console.*` calls as `log` messages.
    pub capture_console: bool,
    /// Budget for the whole execution. `None` uses the configured default.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    fn new(script: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            script: script.into(),
            mode,
            capture_console: true,
            timeout: None,
        }
    }

    /// Function mode: call the exported function with `args`.
    pub fn function(script: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(script, ExecutionMode::Function { args })
    }

    /// Module mode.
    pub fn module(script: impl Into<String>) -> Self {
        Self::new(script, ExecutionMode::Module)
    }

    /// Test mode.
    pub fn tests(script: impl Into<String>) -> Self {
        Self::new(script, ExecutionMode::Tests)
    }

    /// Sets whether console output is captured.
    #[must_use]
    pub fn capture_console(mut self, capture: bool) -> Self {
        self.capture_console = capture;
        self
    }

    /// Overrides the configured execution timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Positional arguments (empty outside function mode).
    pub fn args(&self) -> &[Value] {
        match &self.mode {
            ExecutionMode::Function { args } => args,
            _ => &[],
        }
    }
}

/// Live messages of one execution.
///
/// The stream always ends with exactly one terminal status: if the sending
/// side goes away first, a `failed` status is synthesized.
#[derive(Debug)]
pub struct ExecutionStream {
    job_id: String,
    receiver: mpsc::UnboundedReceiver<CodeExecutionMessage>,
    last_timestamp: Timestamp,
    finished: bool,
}

impl ExecutionStream {
    pub(crate) fn new(
        job_id: String,
        receiver: mpsc::UnboundedReceiver<CodeExecutionMessage>,
    ) -> Self {
        Self {
            job_id,
            receiver,
            last_timestamp: Timestamp::MIN,
            finished: false,
        }
    }

    /// Identifier of the job, as used in logs and the job directory name.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Drains the stream through a [`BufferedCollector`].
    pub async fn collect_buffered(mut self) -> ExecutionResult {
        let mut collector = BufferedCollector::new();
        while let Some(message) = self.next().await {
            if collector.push(message) {
                break;
            }
        }
        collector.finish()
    }
}

impl Stream for ExecutionStream {
    type Item = CodeExecutionMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                this.last_timestamp = this.last_timestamp.max(message.timestamp());
                this.finished = message.is_terminal();
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(CodeExecutionMessage::failed(
                    dropped_reason(),
                    now_millis().max(this.last_timestamp),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
