//! Per-instance supervisor.
//!
//! One tokio task per pool slot owns the slot's runtime process and drives the
//! [`InstanceState`] machine: boot, pull one job at a time from the shared
//! FIFO queue, relay that job's messages, enforce its timeout, and respawn the
//! process (within the restart budget) after a crash or kill.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

use super::launcher::{ProcessHandle, RuntimeLauncher, RuntimeOutput, RuntimeProcess, RuntimeStdin};
use super::queue::JobQueue;
use super::state::{InstanceEvent, InstanceState, RestartPolicy};
use super::workspace::InstanceWorkspace;
use super::SandboxError;
use crate::config::Config;
use crate::execution::{ExecutionMode, ExecutionRequest};
use crate::protocol::{
    decode_frame, encode_frame, now_millis, CodeExecutionMessage, ExceptionPayload,
    ExecutionStatus, HostCommand, RuntimeEvent, Timestamp,
};
use crate::runtime;

/// How long an exited process gets to report its exit code.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a process gets to exit after a shutdown command.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Failure reason for an execution that exceeded its budget.
pub fn timeout_reason(timeout: Duration) -> String {
    format!("Execution timed out after {} ms", timeout.as_millis())
}

/// Failure reason for an execution whose process died under it.
pub fn crash_reason(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Sandbox process exited unexpectedly (exit code {code})"),
        None => "Sandbox process exited unexpectedly (exit code unknown)".to_string(),
    }
}

/// Failure reason for an execution interrupted by shutdown.
pub fn shutdown_reason() -> String {
    "Sandbox shut down before the execution finished".to_string()
}

/// Failure reason for queued executions once every instance has stopped.
pub fn unavailable_reason() -> String {
    "No sandbox instance is available".to_string()
}

/// A queued execution.
pub(crate) struct Job {
    pub id: String,
    /// Script after import rewriting.
    pub script: String,
    pub request: ExecutionRequest,
    pub timeout: Duration,
    pub sink: mpsc::UnboundedSender<CodeExecutionMessage>,
}

impl Job {
    /// Resolves a job that never reached an instance.
    pub fn reject(&self, reason: String) {
        JobRun::new(self).fail(reason);
    }
}

/// Published view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Most recent boot or crash reason.
    pub last_error: Option<String>,
}

impl SlotStatus {
    /// True while the slot has a live process accepting or running jobs.
    pub fn is_serving(&self) -> bool {
        matches!(self.state, InstanceState::Ready | InstanceState::Busy)
    }
}

impl Default for SlotStatus {
    fn default() -> Self {
        Self {
            state: InstanceState::Starting,
            last_error: None,
        }
    }
}

/// State shared by the manager and every supervisor.
pub(crate) struct Shared {
    pub config: Config,
    pub launcher: Arc<dyn RuntimeLauncher>,
    pub slots: watch::Sender<Vec<SlotStatus>>,
    pub shutdown: CancellationToken,
}

// -----------------------------------------------------------------------------
// Connection to a running process
// -----------------------------------------------------------------------------

/// What the reader task hands the supervisor.
#[derive(Debug)]
enum Inbound {
    Event(RuntimeEvent),
    /// A protocol frame that could not be decoded.
    Malformed(String),
}

struct Connection {
    stdin: RuntimeStdin,
    events: mpsc::Receiver<Inbound>,
    handle: Box<dyn ProcessHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn start(process: RuntimeProcess) -> Self {
        let (tx, events) = mpsc::channel(256);
        let mut tasks = vec![tokio::spawn(read_events(process.stdout, tx).in_current_span())];
        if let Some(stderr) = process.stderr {
            tasks.push(tokio::spawn(forward_stderr(stderr).in_current_span()));
        }
        Self {
            stdin: process.stdin,
            events,
            handle: process.handle,
            tasks,
        }
    }

    async fn wait_ready(&mut self) -> Result<String, SandboxError> {
        while let Some(event) = self.events.recv().await {
            match event {
                Inbound::Event(RuntimeEvent::Ready { version }) => return Ok(version),
                other => debug!(?other, "ignoring event before ready"),
            }
        }
        Err(SandboxError::transport(
            "runtime closed its output before signalling readiness",
        ))
    }

    async fn send(&mut self, command: &HostCommand) -> Result<(), SandboxError> {
        let frame = encode_frame(command)?;
        self.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))
    }

    /// Collects the exit code of a process whose output has closed.
    async fn reap(&mut self) -> Option<i32> {
        match tokio::time::timeout(REAP_TIMEOUT, self.handle.wait()).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to reap runtime process");
                None
            }
            Err(_) => {
                warn!("runtime closed its output but did not exit; killing it");
                self.kill().await;
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.handle.kill().await {
            warn!(pid = self.handle.id(), error = %e, "failed to kill runtime process");
        }
    }

    /// Asks the runtime to exit, killing it if it does not.
    async fn shutdown(&mut self) {
        if self.send(&HostCommand::Shutdown).await.is_ok()
            && tokio::time::timeout(SHUTDOWN_GRACE, self.handle.wait())
                .await
                .is_ok()
        {
            return;
        }
        self.kill().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_events(stdout: RuntimeOutput, tx: mpsc::Sender<Inbound>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let inbound = match lines.next_line().await {
            Ok(Some(line)) => match decode_frame::<RuntimeEvent>(&line) {
                Ok(Some(event)) => Inbound::Event(event),
                Ok(None) => {
                    if !line.trim().is_empty() {
                        debug!(%line, "runtime stdout");
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "malformed runtime frame");
                    Inbound::Malformed(e.to_string())
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read runtime output");
                break;
            }
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
}

async fn forward_stderr(stderr: RuntimeOutput) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(%line, "runtime stderr");
        }
    }
}

// -----------------------------------------------------------------------------
// One job's message relay
// -----------------------------------------------------------------------------

/// Relays one job's messages to its caller, keeping timestamps non-decreasing.
struct JobRun<'a> {
    job: &'a Job,
    last_timestamp: Timestamp,
    /// Set when the host had to drop part of the output; turns `completed` into `failed`.
    poisoned: Option<String>,
}

impl<'a> JobRun<'a> {
    fn new(job: &'a Job) -> Self {
        Self {
            job,
            last_timestamp: Timestamp::MIN,
            poisoned: None,
        }
    }

    /// Forwards one message. Returns true if it was the terminal status.
    fn forward(&mut self, message: CodeExecutionMessage) -> bool {
        let mut message = match (message, self.poisoned.take()) {
            (
                CodeExecutionMessage::Status {
                    status: ExecutionStatus::Completed,
                    timestamp,
                    ..
                },
                Some(reason),
            ) => CodeExecutionMessage::failed(reason, timestamp),
            (message, poisoned) => {
                self.poisoned = poisoned;
                message
            }
        };

        message.clamp_timestamp(self.last_timestamp);
        self.last_timestamp = message.timestamp();
        let terminal = message.is_terminal();
        if self.job.sink.send(message).is_err() {
            debug!("caller dropped the execution stream");
        }
        terminal
    }

    fn now(&self) -> Timestamp {
        now_millis().max(self.last_timestamp)
    }

    fn exception(&mut self, exception: ExceptionPayload) {
        let timestamp = self.now();
        self.forward(CodeExecutionMessage::Exception {
            exception,
            timestamp,
        });
    }

    fn fail(&mut self, reason: String) {
        let timestamp = self.now();
        self.forward(CodeExecutionMessage::failed(reason, timestamp));
    }

    /// Records output the host could not deliver; the run can no longer complete.
    fn poison(&mut self, reason: String) {
        self.exception(ExceptionPayload::error("SandboxError", reason.clone()));
        self.poisoned = Some(reason);
    }
}

enum JobOutcome {
    /// Terminal status delivered; the process is still healthy.
    Finished,
    TimedOut,
    Crashed,
    ShutDown,
}

enum Idle {
    Shutdown,
    Exited,
    Noise(Inbound),
    Job(Job),
    QueueClosed,
}

enum Step {
    Shutdown,
    TimedOut,
    Exited,
    Event(Inbound),
}

// -----------------------------------------------------------------------------
// Supervisor
// -----------------------------------------------------------------------------

pub(crate) struct Supervisor {
    index: usize,
    shared: Arc<Shared>,
    jobs: JobQueue,
    workspace: InstanceWorkspace,
    state: InstanceState,
    restarts: RestartPolicy,
}

impl Supervisor {
    pub fn new(
        index: usize,
        shared: Arc<Shared>,
        jobs: JobQueue,
        workspace: InstanceWorkspace,
    ) -> Self {
        let restarts = RestartPolicy::new(
            shared.config.pool.max_restarts,
            shared.config.pool.restart_delay(),
        );
        Self {
            index,
            shared,
            jobs,
            workspace,
            state: InstanceState::Starting,
            restarts,
        }
    }

    /// Runs the slot until it reaches `Stopped`.
    pub async fn run(mut self) {
        let span = info_span!("instance", label = %self.shared.config.label, index = self.index);
        async move {
            loop {
                match self.state {
                    InstanceState::Starting => self.start().await,
                    InstanceState::Crashed => self.recover().await,
                    InstanceState::Stopped => break,
                    InstanceState::Ready | InstanceState::Busy => {
                        error!(state = %self.state, "supervisor lost its process");
                        self.transition(InstanceEvent::Shutdown);
                    }
                }
            }
            self.on_stopped().await;
            debug!("instance stopped");
        }
        .instrument(span)
        .await;
    }

    async fn start(&mut self) {
        let shutdown = self.shared.shutdown.clone();
        let booted = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            booted = self.boot() => Some(booted),
        };

        match booted {
            None => self.transition(InstanceEvent::Shutdown),
            Some(Ok(conn)) => {
                self.restarts.reset();
                self.transition(InstanceEvent::BootSignal);
                self.serve(conn).await;
            }
            Some(Err((event, err))) => {
                warn!(error = %err, "instance failed to boot");
                self.record_error(err.to_string());
                self.transition(event);
                if matches!(err, SandboxError::Launch { .. }) {
                    error!("runtime cannot be launched; stopping instance");
                    self.transition(InstanceEvent::RestartsExhausted);
                }
            }
        }
    }

    async fn boot(&mut self) -> Result<Connection, (InstanceEvent, SandboxError)> {
        let exited = |e| (InstanceEvent::ProcessExited, e);

        self.workspace.prepare().await.map_err(exited)?;
        let process = self
            .shared
            .launcher
            .launch(&self.workspace)
            .await
            .map_err(exited)?;
        let mut conn = Connection::start(process);

        let budget = self.shared.config.pool.boot_timeout();
        match tokio::time::timeout(budget, conn.wait_ready()).await {
            Ok(Ok(version)) => {
                info!(pid = conn.handle.id(), %version, launcher = self.shared.launcher.name(), "instance ready");
                Ok(conn)
            }
            Ok(Err(err)) => {
                let code = conn.reap().await;
                debug!(exit_code = ?code, "runtime exited during boot");
                Err(exited(err))
            }
            Err(_) => {
                conn.kill().await;
                Err((InstanceEvent::BootTimeout, SandboxError::boot_timeout(budget)))
            }
        }
    }

    /// Ready/Busy loop. Returns once the process is gone.
    async fn serve(&mut self, mut conn: Connection) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let idle = tokio::select! {
                biased;
                () = shutdown.cancelled() => Idle::Shutdown,
                event = conn.events.recv() => event.map_or(Idle::Exited, Idle::Noise),
                job = self.jobs.pop() => job.map_or(Idle::QueueClosed, Idle::Job),
            };

            let job = match idle {
                Idle::Shutdown | Idle::QueueClosed => {
                    conn.shutdown().await;
                    self.transition(InstanceEvent::Shutdown);
                    return;
                }
                Idle::Exited => {
                    let code = conn.reap().await;
                    warn!(exit_code = ?code, "runtime exited while idle");
                    self.record_error(crash_reason(code));
                    self.transition(InstanceEvent::ProcessExited);
                    return;
                }
                Idle::Noise(event) => {
                    debug!(?event, "ignoring event while idle");
                    continue;
                }
                Idle::Job(job) => job,
            };

            if job.sink.is_closed() {
                debug!(job_id = %job.id, "skipping abandoned execution");
                continue;
            }

            self.transition(InstanceEvent::Dispatched);
            let span = debug_span!("job", id = %job.id, mode = job.request.mode.as_str());
            let outcome = self.run_job(&mut conn, &job).instrument(span).await;
            if self.shared.config.execution.cleanup {
                self.workspace.remove_job(&job.id).await;
            }

            match outcome {
                JobOutcome::Finished => self.transition(InstanceEvent::TerminalBuffered),
                JobOutcome::TimedOut => {
                    conn.kill().await;
                    self.transition(InstanceEvent::ExecutionTimedOut);
                    return;
                }
                JobOutcome::Crashed => {
                    self.transition(InstanceEvent::ProcessExited);
                    return;
                }
                JobOutcome::ShutDown => {
                    conn.kill().await;
                    self.transition(InstanceEvent::Shutdown);
                    return;
                }
            }
        }
    }

    async fn run_job(&mut self, conn: &mut Connection, job: &Job) -> JobOutcome {
        let mut run = JobRun::new(job);
        let started = Instant::now();

        let command = match self.prepare(job).await {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "failed to prepare job");
                run.exception(ExceptionPayload::error("SandboxError", err.to_string()));
                run.fail(format!("Failed to prepare execution: {err}"));
                return JobOutcome::Finished;
            }
        };

        if let Err(err) = conn.send(&command).await {
            warn!(error = %err, "failed to hand job to runtime");
            let code = conn.reap().await;
            self.record_error(crash_reason(code));
            run.fail(crash_reason(code));
            return JobOutcome::Crashed;
        }

        let shutdown = self.shared.shutdown.clone();
        let deadline = tokio::time::sleep(job.timeout);
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                biased;
                () = shutdown.cancelled() => Step::Shutdown,
                () = &mut deadline => Step::TimedOut,
                event = conn.events.recv() => event.map_or(Step::Exited, Step::Event),
            };

            match step {
                Step::Shutdown => {
                    run.fail(shutdown_reason());
                    return JobOutcome::ShutDown;
                }
                Step::TimedOut => {
                    warn!(timeout_ms = %job.timeout.as_millis(), "execution timed out; killing runtime");
                    self.record_error(timeout_reason(job.timeout));
                    run.fail(timeout_reason(job.timeout));
                    return JobOutcome::TimedOut;
                }
                Step::Exited => {
                    let code = conn.reap().await;
                    warn!(exit_code = ?code, "runtime exited during execution");
                    self.record_error(crash_reason(code));
                    run.fail(crash_reason(code));
                    return JobOutcome::Crashed;
                }
                Step::Event(Inbound::Event(RuntimeEvent::Job { job_id, message }))
                    if job_id == job.id =>
                {
                    if run.forward(message) {
                        debug!(elapsed_ms = %started.elapsed().as_millis(), "execution finished");
                        return JobOutcome::Finished;
                    }
                }
                Step::Event(Inbound::Event(RuntimeEvent::SpilledResult {
                    job_id,
                    file,
                    timestamp,
                })) if job_id == job.id => match self.load_spilled(&file).await {
                    Ok(result) => {
                        run.forward(CodeExecutionMessage::Result { result, timestamp });
                    }
                    Err(err) => {
                        warn!(%file, error = %err, "failed to read spilled result");
                        run.poison(format!("Failed to read spilled result: {err}"));
                    }
                },
                Step::Event(Inbound::Malformed(err)) => {
                    run.poison(format!("Dropped a malformed runtime message: {err}"));
                }
                Step::Event(other) => debug!(?other, "ignoring event for another job"),
            }
        }
    }

    /// Writes the job's files and builds the command for the runtime.
    async fn prepare(&self, job: &Job) -> Result<HostCommand, SandboxError> {
        let files = runtime::write_job(
            &self.workspace.jobs_dir,
            &job.id,
            &job.script,
            &job.request.mode,
            job.request.capture_console,
        )
        .await?;

        let (args, args_file) = match &job.request.mode {
            ExecutionMode::Function { args } => {
                let json = serde_json::to_string(args)?;
                if json.len() >= self.shared.config.execution.large_payload_threshold {
                    debug!(bytes = json.len(), "spilling large arguments");
                    (None, Some(self.workspace.spill_args(&job.id, &json).await?))
                } else {
                    (Some(args.clone()), None)
                }
            }
            ExecutionMode::Module | ExecutionMode::Tests => (None, None),
        };

        Ok(HostCommand::Job {
            job_id: job.id.clone(),
            job_dir: files.dir.display().to_string(),
            worker_file: files.worker_file.display().to_string(),
            args,
            args_file,
        })
    }

    async fn load_spilled(&self, file: &str) -> Result<Value, SandboxError> {
        let text = self
            .workspace
            .read_spill(file, self.shared.config.execution.cleanup)
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Crashed: respawn within the budget, or stop.
    async fn recover(&mut self) {
        let shutdown = self.shared.shutdown.clone();
        if shutdown.is_cancelled() {
            self.transition(InstanceEvent::Shutdown);
            return;
        }

        let Some(delay) = self.restarts.next_restart() else {
            error!(
                max_restarts = self.shared.config.pool.max_restarts,
                "restart budget exhausted; stopping instance"
            );
            self.transition(InstanceEvent::RestartsExhausted);
            return;
        };

        info!(
            attempt = self.restarts.used(),
            delay_ms = %delay.as_millis(),
            "respawning instance"
        );
        let cancelled = tokio::select! {
            biased;
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        };
        if cancelled {
            self.transition(InstanceEvent::Shutdown);
        } else {
            self.transition(InstanceEvent::Respawn);
        }
    }

    /// Once every slot has stopped on its own, nothing will ever serve the
    /// queue: close it and fail whatever is still waiting.
    async fn on_stopped(&self) {
        if self.shared.shutdown.is_cancelled() || self.jobs.is_closed() {
            return;
        }
        let all_stopped = self
            .shared
            .slots
            .borrow()
            .iter()
            .all(|slot| slot.state == InstanceState::Stopped);
        if !all_stopped {
            return;
        }

        let rejected = self.jobs.close(unavailable_reason).await;
        error!(rejected, "every instance has stopped; failing queued executions");
    }

    fn transition(&mut self, event: InstanceEvent) {
        match self.state.on(event) {
            Ok(next) => {
                debug!(from = %self.state, to = %next, ?event, "instance transition");
                self.state = next;
                let index = self.index;
                self.shared.slots.send_modify(|slots| {
                    if let Some(slot) = slots.get_mut(index) {
                        slot.state = next;
                        if next == InstanceState::Ready {
                            slot.last_error = None;
                        }
                    }
                });
            }
            Err(e) => error!(error = %e, "ignoring invalid transition"),
        }
    }

    fn record_error(&self, message: String) {
        let index = self.index;
        self.shared.slots.send_modify(|slots| {
            if let Some(slot) = slots.get_mut(index) {
                slot.last_error = Some(message);
            }
        });
    }
}
