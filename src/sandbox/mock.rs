//! Mock runtime launcher for testing.
//!
//! Each launch spawns an in-memory fake runtime wired to the supervisor with
//! duplex pipes. The fake speaks the real wire protocol and interprets
//! `// mock: <op> <arg>` directives found in the job's script:
//!
//! | op | effect |
//! |---|---|
//! | `log <text>` | emit a `log` message |
//! | `warn <text>` | emit a `log` message at `warn` level |
//! | `stale <text>` | emit a `log` message stamped with a clock far in the past |
//! | `sleep <ms>` | wait |
//! | `hang` | never finish |
//! | `crash <code>` | exit the whole process with `code` |
//! | `return <json>` | complete with `result` |
//! | `return-args` | complete with the received arguments |
//! | `return-large <n>` | complete with an `n`-character string, spilled to the ipc dir |
//! | `return-deep <n>` | complete with arrays nested `n` levels deep |
//! | `throw <message>` | emit `exception` + `failed` |
//! | `noise` | write a non-protocol line to stdout |
//! | `foreign` | emit a message tagged with another job id |

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use super::launcher::{ProcessHandle, RuntimeLauncher, RuntimeProcess};
use super::workspace::InstanceWorkspace;
use super::SandboxError;
use crate::protocol::{
    decode_frame, encode_frame, now_millis, CodeExecutionMessage, ExceptionPayload,
    ExecutionStatus, HostCommand, LogLevel, RuntimeEvent,
};
use crate::runtime::{SCRIPT_FILE, WORKER_FILE};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Exit code of a runtime booted with [`MockBoot::ExitWhenIdle`].
pub(crate) const IDLE_EXIT_CODE: i32 = 11;

/// How a launched fake runtime behaves before accepting jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockBoot {
    /// Signal readiness immediately.
    Ready,
    /// Never signal readiness.
    Hang,
    /// Exit with the given code before signalling readiness.
    Exit(i32),
    /// Signal readiness, then exit with [`IDLE_EXIT_CODE`] after this many
    /// milliseconds unless a job arrives first.
    ExitWhenIdle(u64),
    /// Fail to launch at all.
    LaunchError,
}

/// A mock launcher for testing.
///
/// Launch `n` uses `boots[n]`; launches past the end of the list boot normally.
#[derive(Debug, Clone)]
pub(crate) struct MockLauncher {
    boots: Arc<Vec<MockBoot>>,
    stats: Arc<MockStats>,
}

#[derive(Debug, Default)]
struct MockStats {
    launches: AtomicUsize,
    kills: AtomicUsize,
    jobs: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::with_boots(Vec::new())
    }

    pub fn with_boots(boots: Vec<MockBoot>) -> Self {
        Self {
            boots: Arc::new(boots),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Number of processes launched so far.
    pub fn launch_count(&self) -> usize {
        self.stats.launches.load(Ordering::SeqCst)
    }

    /// Number of processes killed by the supervisor.
    pub fn kill_count(&self) -> usize {
        self.stats.kills.load(Ordering::SeqCst)
    }

    /// Number of jobs received across all processes.
    pub fn job_count(&self) -> usize {
        self.stats.jobs.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running jobs seen by any single process.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeLauncher for MockLauncher {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn launch(&self, workspace: &InstanceWorkspace) -> Result<RuntimeProcess, SandboxError> {
        let index = self.stats.launches.fetch_add(1, Ordering::SeqCst);
        let boot = self.boots.get(index).copied().unwrap_or(MockBoot::Ready);
        if boot == MockBoot::LaunchError {
            return Err(SandboxError::launch("mock", "launch refused"));
        }

        let (host_stdin, runtime_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (runtime_stdout, host_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let fake = FakeRuntime {
            ipc_dir: workspace.ipc_dir.clone(),
            stats: Arc::clone(&self.stats),
        };
        let task = tokio::spawn(fake.run(boot, runtime_stdin, runtime_stdout));

        Ok(RuntimeProcess {
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            stderr: None,
            handle: Box::new(MockHandle {
                task: Some(task),
                exit: None,
                stats: Arc::clone(&self.stats),
            }),
        })
    }
}

struct MockHandle {
    task: Option<JoinHandle<i32>>,
    exit: Option<Option<i32>>,
    stats: Arc<MockStats>,
}

#[async_trait]
impl ProcessHandle for MockHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            self.stats.kills.fetch_add(1, Ordering::SeqCst);
            self.exit = Some(None);
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        let code = task.await.ok();
        self.task = None;
        self.exit = Some(code);
        Ok(code)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

type Output = Arc<Mutex<DuplexStream>>;

struct FakeRuntime {
    ipc_dir: PathBuf,
    stats: Arc<MockStats>,
}

struct FakeJob {
    job_id: String,
    job_dir: PathBuf,
    args: Vec<Value>,
}

impl FakeRuntime {
    async fn run(self, boot: MockBoot, stdin: DuplexStream, stdout: DuplexStream) -> i32 {
        let idle_exit = match boot {
            MockBoot::Hang => std::future::pending().await,
            MockBoot::Exit(code) => return code,
            MockBoot::ExitWhenIdle(ms) => Some(Duration::from_millis(ms)),
            MockBoot::Ready | MockBoot::LaunchError => None,
        };
        let idle_exit = async move {
            match idle_exit {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(idle_exit);

        let out: Output = Arc::new(Mutex::new(stdout));
        write_event(&out, &RuntimeEvent::Ready { version: "mock 1.0".to_string() }).await;

        let this = Arc::new(self);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (crash_tx, mut crash_rx) = mpsc::channel::<i32>(1);
        // Dropping the set aborts running jobs, closing every writer.
        let mut jobs = JoinSet::new();
        let mut lines = BufReader::new(stdin).lines();

        loop {
            tokio::select! {
                Some(code) = crash_rx.recv() => return code,
                () = &mut idle_exit, if jobs.is_empty() => return IDLE_EXIT_CODE,
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { return 0 };
                    match decode_frame::<HostCommand>(&line) {
                        Ok(Some(HostCommand::Job { job_id, job_dir, args, args_file, .. })) => {
                            let args = match (args, args_file) {
                                (Some(args), _) => args,
                                (None, Some(file)) => this.read_spilled_args(&file).await,
                                (None, None) => Vec::new(),
                            };
                            let job = FakeJob { job_id, job_dir: PathBuf::from(job_dir), args };
                            let runtime = Arc::clone(&this);
                            let out = Arc::clone(&out);
                            let crash = crash_tx.clone();
                            let in_flight = Arc::clone(&in_flight);
                            jobs.spawn(async move { runtime.run_job(job, out, crash, in_flight).await });
                        }
                        Ok(Some(HostCommand::Shutdown)) => return 0,
                        Ok(None) | Err(_) => {}
                    }
                }
            }
        }
    }

    async fn read_spilled_args(&self, file: &str) -> Vec<Value> {
        let path = self.ipc_dir.join(file);
        let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&path).await;
        serde_json::from_str(&text).unwrap_or_default()
    }

    async fn run_job(
        &self,
        job: FakeJob,
        out: Output,
        crash: mpsc::Sender<i32>,
        in_flight: Arc<AtomicUsize>,
    ) {
        self.stats.jobs.fetch_add(1, Ordering::SeqCst);
        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let script = tokio::fs::read_to_string(job.job_dir.join(SCRIPT_FILE))
            .await
            .unwrap_or_default();
        let worker = tokio::fs::read_to_string(job.job_dir.join(WORKER_FILE))
            .await
            .unwrap_or_default();
        let capture = !worker.contains(r#""captureConsole":false"#);

        let emit = |message: CodeExecutionMessage| {
            let out = Arc::clone(&out);
            let job_id = job.job_id.clone();
            async move { write_event(&out, &RuntimeEvent::Job { job_id, message }).await }
        };

        emit(status(ExecutionStatus::Running, None)).await;

        let mut result = None;
        let mut thrown = None;
        for line in script.lines() {
            let Some(directive) = line.trim().strip_prefix("// mock:") else {
                continue;
            };
            let directive = directive.trim();
            let (op, arg) = directive.split_once(' ').unwrap_or((directive, ""));
            match op {
                "log" | "warn" if capture => {
                    let level = if op == "warn" { LogLevel::Warn } else { LogLevel::Log };
                    emit(CodeExecutionMessage::Log {
                        text: arg.to_string(),
                        level,
                        timestamp: now_millis(),
                    })
                    .await;
                }
                "stale" if capture => {
                    emit(CodeExecutionMessage::Log {
                        text: arg.to_string(),
                        level: LogLevel::Log,
                        timestamp: 1,
                    })
                    .await;
                }
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(arg.parse().unwrap_or(0))).await;
                }
                "hang" => std::future::pending::<()>().await,
                "crash" => {
                    let _ = crash.send(arg.parse().unwrap_or(1)).await;
                    std::future::pending::<()>().await;
                }
                "return" => {
                    result = Some(serde_json::from_str(arg).unwrap_or(Value::String(arg.to_string())));
                }
                "return-args" => result = Some(Value::Array(job.args.clone())),
                "return-deep" => {
                    let depth: usize = arg.parse().unwrap_or(0);
                    result = Some((0..depth).fold(json!(0), |inner, _| json!([inner])));
                }
                "return-large" => {
                    let size: usize = arg.parse().unwrap_or(0);
                    let file = format!("{}.{}.output.json", now_millis(), job.job_id);
                    let json = Value::String("x".repeat(size)).to_string();
                    let _ = tokio::fs::write(self.ipc_dir.join(&file), json).await;
                    write_event(
                        &out,
                        &RuntimeEvent::SpilledResult {
                            job_id: job.job_id.clone(),
                            file,
                            timestamp: now_millis(),
                        },
                    )
                    .await;
                }
                "throw" => {
                    thrown = Some(arg.to_string());
                    break;
                }
                "noise" => {
                    let mut writer = out.lock().await;
                    let _ = writer.write_all(b"Download https://registry.npmjs.org/cheerio\n").await;
                }
                "foreign" => {
                    write_event(
                        &out,
                        &RuntimeEvent::Job {
                            job_id: "someone-else".to_string(),
                            message: status(ExecutionStatus::Completed, None),
                        },
                    )
                    .await;
                }
                _ => {}
            }
        }

        if let Some(message) = thrown {
            emit(CodeExecutionMessage::Exception {
                exception: ExceptionPayload::error("Error", message.clone()),
                timestamp: now_millis(),
            })
            .await;
            emit(status(ExecutionStatus::Failed, Some(message))).await;
        } else {
            if let Some(result) = result {
                emit(CodeExecutionMessage::Result {
                    result,
                    timestamp: now_millis(),
                })
                .await;
            }
            emit(status(ExecutionStatus::Completed, None)).await;
        }

        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn status(status: ExecutionStatus, error: Option<String>) -> CodeExecutionMessage {
    CodeExecutionMessage::Status {
        status,
        error,
        timestamp: now_millis(),
    }
}

async fn write_event(out: &Output, event: &RuntimeEvent) {
    let Ok(frame) = encode_frame(event) else {
        return;
    };
    let mut writer = out.lock().await;
    let _ = writer.write_all(frame.as_bytes()).await;
    let _ = writer.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mock_launcher_name_and_counts() {
        let launcher = MockLauncher::new();
        assert_eq!(launcher.name(), "Mock");
        assert_eq!(launcher.launch_count(), 0);
        assert_eq!(launcher.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_signals_ready() {
        let dir = TempDir::new().unwrap();
        let workspace = InstanceWorkspace::new(dir.path(), 0);
        let launcher = MockLauncher::new();
        let process = launcher.launch(&workspace).await.unwrap();

        let mut lines = BufReader::new(process.stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let event: RuntimeEvent = decode_frame(&line).unwrap().unwrap();
        assert!(matches!(event, RuntimeEvent::Ready { .. }));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_boot_sequence() {
        let dir = TempDir::new().unwrap();
        let workspace = InstanceWorkspace::new(dir.path(), 0);
        let launcher = MockLauncher::with_boots(vec![MockBoot::LaunchError, MockBoot::Exit(3)]);

        assert!(launcher.launch(&workspace).await.is_err());

        let mut process = launcher.launch(&workspace).await.unwrap();
        assert_eq!(process.handle.wait().await.unwrap(), Some(3));
        assert_eq!(process.handle.wait().await.unwrap(), Some(3));

        let mut process = launcher.launch(&workspace).await.unwrap();
        process.handle.kill().await.unwrap();
        assert_eq!(process.handle.wait().await.unwrap(), None);
        assert_eq!(launcher.kill_count(), 1);
    }
}
