//! The sandbox manager: a pool of supervised runtime instances behind one
//! FIFO job queue.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

use super::instance::{shutdown_reason, Job, Shared, SlotStatus, Supervisor};
use super::launcher::{DenoLauncher, RuntimeLauncher};
use super::queue::JobQueue;
use super::state::InstanceState;
use super::workspace::{InstanceWorkspace, SANDBOX_DIR};
use super::SandboxError;
use crate::collector::ExecutionResult;
use crate::config::Config;
use crate::execution::{ExecutionRequest, ExecutionStream};
use crate::imports::rewrite_imports;

/// Runs untrusted scripts in supervised, isolated runtime processes.
///
/// Construction spawns one supervisor task per pool slot and returns
/// immediately; it must happen inside a tokio runtime. Each instance runs at
/// most one execution at a time. Requests wait in a single FIFO queue and are
/// picked up by whichever instance becomes ready first.
///
/// Script-level failures (exceptions, timeouts, crashes) never surface as
/// `Err`: they end the execution's message stream with a `failed` status.
pub struct SandboxManager {
    shared: Arc<Shared>,
    queue: JobQueue,
    slots: watch::Receiver<Vec<SlotStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    workspaces: Vec<InstanceWorkspace>,
    work_dir: PathBuf,
    span: Span,
}

impl SandboxManager {
    /// Creates a manager backed by Deno processes.
    pub fn new(work_dir: impl Into<PathBuf>, config: Config) -> Result<Self, SandboxError> {
        let launcher = Arc::new(DenoLauncher::new(&config));
        Self::with_launcher(work_dir, config, launcher)
    }

    /// Creates a manager with a custom launcher.
    pub fn with_launcher(
        work_dir: impl Into<PathBuf>,
        config: Config,
        launcher: Arc<dyn RuntimeLauncher>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        let work_dir = work_dir.into();
        let size = config.pool.size;
        let span = info_span!("sandbox", label = %config.label);

        let (slots_tx, slots) = watch::channel(vec![SlotStatus::default(); size]);
        let queue = JobQueue::new();
        let shared = Arc::new(Shared {
            config,
            launcher,
            slots: slots_tx,
            shutdown: CancellationToken::new(),
        });

        let workspaces: Vec<_> = (0..size)
            .map(|index| InstanceWorkspace::new(&work_dir, index))
            .collect();
        let tasks = workspaces
            .iter()
            .enumerate()
            .map(|(index, workspace)| {
                let supervisor = Supervisor::new(
                    index,
                    Arc::clone(&shared),
                    queue.clone(),
                    workspace.clone(),
                );
                tokio::spawn(supervisor.run())
            })
            .collect();

        span.in_scope(|| {
            info!(
                pool = size,
                work_dir = %work_dir.display(),
                launcher = shared.launcher.name(),
                "sandbox manager started"
            );
        });

        Ok(Self {
            shared,
            queue,
            slots,
            tasks: Mutex::new(tasks),
            workspaces,
            work_dir,
            span,
        })
    }

    /// Root directory the instances live under.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The validated configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Snapshot of every slot's state.
    pub fn states(&self) -> Vec<InstanceState> {
        self.slots.borrow().iter().map(|slot| slot.state).collect()
    }

    /// Waits until at least one instance is serving (`Ready` or `Busy`).
    ///
    /// Fails with `BootTimeout` after `pool.boot_timeout_ms`, or with
    /// `RuntimeUnavailable` as soon as every instance has stopped.
    pub async fn wait_for_ready(&self) -> Result<(), SandboxError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SandboxError::ShutDown);
        }

        let budget = self.shared.config.pool.boot_timeout();
        let mut rx = self.slots.clone();
        let waited = tokio::time::timeout(
            budget,
            rx.wait_for(|slots| {
                slots.iter().any(SlotStatus::is_serving)
                    || slots.iter().all(|slot| slot.state == InstanceState::Stopped)
            }),
        )
        .instrument(self.span.clone())
        .await;

        match waited {
            Err(_) => Err(SandboxError::boot_timeout(budget)),
            Ok(Err(_)) => Err(SandboxError::ShutDown),
            Ok(Ok(slots)) => {
                if slots.iter().any(SlotStatus::is_serving) {
                    Ok(())
                } else if self.shared.shutdown.is_cancelled() {
                    Err(SandboxError::ShutDown)
                } else {
                    Err(SandboxError::runtime_unavailable(describe_failures(&slots)))
                }
            }
        }
    }

    /// Queues one execution and returns its live message stream.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionStream, SandboxError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SandboxError::ShutDown);
        }

        let config = &self.shared.config;
        let id = Uuid::new_v4().simple().to_string();
        let script = if config.execution.rewrite_imports {
            rewrite_imports(&request.script).into_owned()
        } else {
            request.script.clone()
        };
        let timeout = request
            .timeout
            .unwrap_or_else(|| config.execution.default_timeout());
        let (sink, receiver) = mpsc::unbounded_channel();

        self.span.in_scope(|| {
            debug!(
                job_id = %id,
                mode = request.mode.as_str(),
                timeout_ms = %timeout.as_millis(),
                "queueing execution"
            );
        });

        let job = Job {
            id: id.clone(),
            script,
            request,
            timeout,
            sink,
        };
        if self.queue.push(job).is_err() {
            return Err(if self.shared.shutdown.is_cancelled() {
                SandboxError::ShutDown
            } else {
                SandboxError::runtime_unavailable(describe_failures(&self.slots.borrow()))
            });
        }

        Ok(ExecutionStream::new(id, receiver))
    }

    /// Runs one execution to completion and returns everything it emitted.
    pub async fn execute_buffered(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        Ok(self.execute(request).await?.collect_buffered().await)
    }

    /// Calls the script's exported function with `args`, capturing console output.
    pub async fn execute_function_buffered(
        &self,
        script: &str,
        args: Vec<Value>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute_buffered(ExecutionRequest::function(script, args))
            .await
    }

    /// Evaluates the script as a module.
    pub async fn execute_code_buffered(&self, script: &str) -> Result<ExecutionResult, SandboxError> {
        self.execute_buffered(ExecutionRequest::module(script)).await
    }

    /// Evaluates the script and runs its registered test cases.
    pub async fn run_tests_buffered(&self, script: &str) -> Result<ExecutionResult, SandboxError> {
        self.execute_buffered(ExecutionRequest::tests(script)).await
    }

    /// Stops every instance. Idempotent.
    ///
    /// In-flight and queued executions end with a `failed` status; later
    /// `execute*` calls fail with [`SandboxError::ShutDown`].
    pub async fn shutdown(&self) {
        let first = !self.shared.shutdown.is_cancelled();
        self.shared.shutdown.cancel();
        let rejected = self.queue.close(shutdown_reason).await;
        if rejected > 0 {
            self.span
                .in_scope(|| info!(rejected, "failed queued executions on shutdown"));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                self.span
                    .in_scope(|| error!(error = %e, "instance supervisor failed"));
            }
        }

        if first && self.shared.config.execution.cleanup {
            for workspace in &self.workspaces {
                workspace.remove().await;
            }
            // Only succeeds once no other manager uses the directory.
            let _ = tokio::fs::remove_dir(self.work_dir.join(SANDBOX_DIR)).await;
        }
        if first {
            self.span.in_scope(|| info!("sandbox manager shut down"));
        }
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn describe_failures(slots: &[SlotStatus]) -> String {
    let reasons: Vec<String> = slots
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| {
            slot.last_error
                .as_ref()
                .map(|reason| format!("instance {index}: {reason}"))
        })
        .collect();
    if reasons.is_empty() {
        "every sandbox instance has stopped".to_string()
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CodeExecutionMessage, ExecutionStatus, LogLevel};
    use crate::sandbox::instance::{crash_reason, timeout_reason, unavailable_reason};
    use crate::sandbox::mock::{MockBoot, MockLauncher, IDLE_EXIT_CODE};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pool.boot_timeout_ms = 2_000;
        config.pool.restart_delay_ms = 10;
        config.pool.max_restarts = 3;
        config
    }

    fn manager_with(dir: &TempDir, config: Config, launcher: &MockLauncher) -> SandboxManager {
        SandboxManager::with_launcher(dir.path(), config, Arc::new(launcher.clone())).unwrap()
    }

    fn assert_single_terminal(result: &ExecutionResult) {
        let terminals = result.messages.iter().filter(|m| m.is_terminal()).count();
        assert_eq!(terminals, 1, "{:?}", result.messages);
        assert!(result.messages.last().unwrap().is_terminal());
    }

    fn assert_timestamps_non_decreasing(result: &ExecutionResult) {
        let timestamps: Vec<i64> = result
            .messages
            .iter()
            .map(CodeExecutionMessage::timestamp)
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]), "{timestamps:?}");
    }

    async fn wait_until_stopped(manager: &SandboxManager) {
        for _ in 0..200 {
            if manager.states().iter().all(|s| *s == InstanceState::Stopped) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instances never stopped: {:?}", manager.states());
    }

    #[tokio::test]
    async fn test_function_result_and_log_order() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);
        manager.wait_for_ready().await.unwrap();

        let script = "// mock: log first\n// mock: warn second\n// mock: return {\"items\": [1, 2]}";
        let result = manager.execute_function_buffered(script, vec![]).await.unwrap();

        assert!(result.is_completed());
        assert_eq!(result.result, Some(json!({"items": [1, 2]})));
        assert_single_terminal(&result);
        assert_timestamps_non_decreasing(&result);
        assert_eq!(
            result.logs(),
            vec![(LogLevel::Log, "first"), (LogLevel::Warn, "second")]
        );
        assert!(matches!(
            result.messages[0],
            CodeExecutionMessage::Status {
                status: ExecutionStatus::Running,
                ..
            }
        ));
        assert!(matches!(result.messages[3], CodeExecutionMessage::Result { .. }));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_thrown_error_fails_without_result() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let result = manager
            .execute_function_buffered("// mock: return 1\n// mock: throw kaboom", vec![])
            .await
            .unwrap();

        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.result, None);
        assert_eq!(result.exceptions().len(), 1);
        assert_eq!(result.error(), Some("kaboom"));
        assert_single_terminal(&result);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_identical_calls_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let args = vec![json!("<html></html>"), json!("https://example.com")];
        let first = manager
            .execute_function_buffered("// mock: return-args", args.clone())
            .await
            .unwrap();
        let second = manager
            .execute_function_buffered("// mock: return-args", args.clone())
            .await
            .unwrap();

        assert_eq!(first.result, Some(Value::Array(args)));
        assert_eq!(first.result, second.result);
        assert_eq!(launcher.launch_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_payloads_use_spill_files() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.execution.large_payload_threshold = 64;
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, config, &launcher);

        let big = "y".repeat(500);
        let echoed = manager
            .execute_function_buffered("// mock: return-args", vec![json!(big)])
            .await
            .unwrap();
        assert_eq!(echoed.result, Some(json!([big])));

        let spilled = manager
            .execute_function_buffered("// mock: return-large 300", vec![])
            .await
            .unwrap();
        assert!(spilled.is_completed());
        assert_eq!(spilled.result, Some(json!("x".repeat(300))));

        let ipc = dir.path().join("sandbox/instance-0/ipc");
        assert_eq!(std::fs::read_dir(ipc).unwrap().count(), 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_kills_and_respawns() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);
        manager.wait_for_ready().await.unwrap();

        let started = std::time::Instant::now();
        let timeout = Duration::from_millis(100);
        let result = manager
            .execute_buffered(ExecutionRequest::function("// mock: hang", vec![]).timeout(timeout))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.error(), Some(timeout_reason(timeout).as_str()));
        assert_eq!(result.error(), Some("Execution timed out after 100 ms"));
        assert_single_terminal(&result);
        assert_timestamps_non_decreasing(&result);

        let next = manager
            .execute_function_buffered("// mock: return \"ok\"", vec![])
            .await
            .unwrap();
        assert_eq!(next.result, Some(json!("ok")));
        assert_eq!(launcher.kill_count(), 1);
        assert_eq!(launcher.launch_count(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_reports_exit_code_and_recovers() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let result = manager
            .execute_function_buffered("// mock: log before\n// mock: crash 7", vec![])
            .await
            .unwrap();
        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.error(), Some(crash_reason(Some(7)).as_str()));
        assert_eq!(result.logs(), vec![(LogLevel::Log, "before")]);
        assert_single_terminal(&result);

        let next = manager
            .execute_function_buffered("// mock: return 2", vec![])
            .await
            .unwrap();
        assert_eq!(next.result, Some(json!(2)));
        assert_eq!(launcher.launch_count(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_job_in_flight_per_instance() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = Arc::new(manager_with(&dir, test_config(), &launcher));

        let mut streams = Vec::new();
        for i in 0..5 {
            let script = format!("// mock: sleep 20\n// mock: return {i}");
            streams.push(
                manager
                    .execute(ExecutionRequest::function(script, vec![]))
                    .await
                    .unwrap(),
            );
        }
        for (i, stream) in streams.into_iter().enumerate() {
            let result = stream.collect_buffered().await;
            assert_eq!(result.result, Some(json!(i)));
        }

        assert_eq!(launcher.job_count(), 5);
        assert_eq!(launcher.max_in_flight(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_spreads_jobs() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.size = 3;
        let launcher = MockLauncher::new();
        let manager = Arc::new(manager_with(&dir, config, &launcher));
        manager.wait_for_ready().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let script = format!("// mock: sleep 30\n// mock: return {i}");
                manager.execute_function_buffered(&script, vec![]).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().result, Some(json!(i)));
        }

        assert_eq!(launcher.launch_count(), 3);
        assert_eq!(launcher.max_in_flight(), 1);
        assert!(dir.path().join("sandbox/instance-2").is_dir());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ignores_noise_and_foreign_events() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let result = manager
            .execute_function_buffered("// mock: noise\n// mock: foreign\n// mock: return 1", vec![])
            .await
            .unwrap();
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.result, Some(json!(1)));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_console_capture_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let request = ExecutionRequest::function("// mock: log hidden\n// mock: return 1", vec![])
            .capture_console(false);
        let result = manager.execute_buffered(request).await.unwrap();
        assert!(result.logs().is_empty());
        assert!(result.is_completed());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_imports_are_rewritten_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.execution.cleanup = false;
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, config, &launcher);

        let stream = manager
            .execute(ExecutionRequest::function(
                "import * as cheerio from \"cheerio\";\n// mock: return 1",
                vec![],
            ))
            .await
            .unwrap();
        let job_id = stream.job_id().to_string();
        assert!(stream.collect_buffered().await.is_completed());

        let script = std::fs::read_to_string(
            dir.path()
                .join("sandbox/instance-0/jobs")
                .join(&job_id)
                .join(crate::runtime::SCRIPT_FILE),
        )
        .unwrap();
        assert!(script.contains("from \"npm:cheerio\""));

        manager.shutdown().await;
        assert!(dir.path().join("sandbox/instance-0").is_dir());
    }

    #[tokio::test]
    async fn test_job_directories_are_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let result = manager
            .execute_function_buffered("// mock: return 1", vec![])
            .await
            .unwrap();
        assert!(result.is_completed());

        // The job directory goes away right after the terminal status is relayed.
        let jobs = dir.path().join("sandbox/instance-0/jobs");
        let mut remaining = usize::MAX;
        for _ in 0..100 {
            remaining = std::fs::read_dir(&jobs).unwrap().count();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);

        manager.shutdown().await;
        assert!(!dir.path().join("sandbox").exists());
    }

    #[tokio::test]
    async fn test_failed_boot_is_retried() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::with_boots(vec![MockBoot::Exit(1), MockBoot::Exit(1)]);
        let manager = manager_with(&dir, test_config(), &launcher);

        manager.wait_for_ready().await.unwrap();
        assert_eq!(launcher.launch_count(), 3);
        assert_eq!(manager.states(), vec![InstanceState::Ready]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_boot_timeout() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.boot_timeout_ms = 100;
        let launcher = MockLauncher::with_boots(vec![MockBoot::Hang; 10]);
        let manager = manager_with(&dir, config, &launcher);

        let err = manager.wait_for_ready().await.unwrap_err();
        assert!(err.is_boot_timeout(), "{err}");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unlaunchable_runtime_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::with_boots(vec![MockBoot::LaunchError]);
        let manager = manager_with(&dir, test_config(), &launcher);

        let err = manager.wait_for_ready().await.unwrap_err();
        assert!(err.is_runtime_unavailable(), "{err}");
        assert!(err.to_string().contains("launch refused"));

        wait_until_stopped(&manager).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = manager
            .execute_function_buffered("// mock: return 1", vec![])
            .await
            .unwrap_err();
        assert!(err.is_runtime_unavailable());
        assert_eq!(launcher.launch_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_fails_queued_jobs() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.max_restarts = 2;
        config.pool.restart_delay_ms = 50;
        let launcher = MockLauncher::with_boots(vec![
            MockBoot::Ready,
            MockBoot::Exit(1),
            MockBoot::Exit(1),
        ]);
        let manager = manager_with(&dir, config, &launcher);
        manager.wait_for_ready().await.unwrap();

        let crashed = manager.execute(ExecutionRequest::function("// mock: crash 9", vec![])).await.unwrap();
        let queued = manager.execute(ExecutionRequest::function("// mock: return 1", vec![])).await.unwrap();

        let crashed = crashed.collect_buffered().await;
        assert_eq!(crashed.error(), Some(crash_reason(Some(9)).as_str()));

        let queued = queued.collect_buffered().await;
        assert_eq!(queued.status(), ExecutionStatus::Failed);
        assert_eq!(queued.error(), Some(unavailable_reason().as_str()));
        assert_single_terminal(&queued);

        wait_until_stopped(&manager).await;
        assert_eq!(launcher.launch_count(), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_resolves_pending_work() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);
        manager.wait_for_ready().await.unwrap();

        let running = manager.execute(ExecutionRequest::function("// mock: hang", vec![])).await.unwrap();
        let queued = manager.execute(ExecutionRequest::function("// mock: return 1", vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.shutdown().await;
        manager.shutdown().await;

        for stream in [running, queued] {
            let result = stream.collect_buffered().await;
            assert_eq!(result.status(), ExecutionStatus::Failed);
            assert_eq!(result.error(), Some(shutdown_reason().as_str()));
            assert_single_terminal(&result);
        }

        assert_eq!(manager.states(), vec![InstanceState::Stopped]);
        let err = manager
            .execute_function_buffered("// mock: return 1", vec![])
            .await
            .unwrap_err();
        assert!(err.is_shut_down());
        assert!(manager.wait_for_ready().await.unwrap_err().is_shut_down());
    }

    #[tokio::test]
    async fn test_undecodable_result_fails_the_execution() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        // Deeper than serde_json's recursion limit once wrapped in the envelope.
        let result = manager
            .execute_function_buffered("// mock: return-deep 130", vec![])
            .await
            .unwrap();
        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.result, None);
        assert_eq!(result.exceptions().len(), 1);
        assert!(
            result.error().unwrap().contains("malformed runtime message"),
            "{:?}",
            result.error()
        );
        assert_single_terminal(&result);
        assert_timestamps_non_decreasing(&result);

        let shallow = manager
            .execute_function_buffered("// mock: return-deep 3", vec![])
            .await
            .unwrap();
        assert_eq!(shallow.result, Some(json!([[[0]]])));
        assert_eq!(launcher.launch_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_timestamps_are_clamped() {
        let dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let manager = manager_with(&dir, test_config(), &launcher);

        let result = manager
            .execute_function_buffered("// mock: stale behind
// mock: return 1", vec![])
            .await
            .unwrap();
        assert!(result.is_completed());
        assert_timestamps_non_decreasing(&result);
        assert_eq!(result.messages[1].timestamp(), result.messages[0].timestamp());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_ready_fails_once_every_instance_stopped() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.max_restarts = 1;
        let launcher = MockLauncher::with_boots(vec![MockBoot::Ready, MockBoot::Exit(1)]);
        let manager = manager_with(&dir, config, &launcher);
        manager.wait_for_ready().await.unwrap();

        let crashed = manager
            .execute_function_buffered("// mock: crash 3", vec![])
            .await
            .unwrap();
        assert_eq!(crashed.error(), Some(crash_reason(Some(3)).as_str()));

        wait_until_stopped(&manager).await;
        let err = manager.wait_for_ready().await.unwrap_err();
        assert!(err.is_runtime_unavailable(), "{err}");
        let err = manager
            .execute_function_buffered("// mock: return 1", vec![])
            .await
            .unwrap_err();
        assert!(err.is_runtime_unavailable(), "{err}");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_exit_is_a_crash_and_respawns() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.restart_delay_ms = 300;
        let launcher = MockLauncher::with_boots(vec![MockBoot::ExitWhenIdle(50)]);
        let manager = manager_with(&dir, config, &launcher);
        manager.wait_for_ready().await.unwrap();

        let mut slots = manager.slots.clone();
        let crashed = tokio::time::timeout(
            Duration::from_secs(2),
            slots.wait_for(|slots| slots[0].state == InstanceState::Crashed),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(crashed[0].last_error, Some(crash_reason(Some(IDLE_EXIT_CODE))));

        manager.wait_for_ready().await.unwrap();
        assert_eq!(manager.states(), vec![InstanceState::Ready]);

        let result = manager
            .execute_function_buffered("// mock: return \"back\"", vec![])
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!("back")));
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.kill_count(), 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.pool.size = 0;
        let result = SandboxManager::with_launcher(dir.path(), config, Arc::new(MockLauncher::new()));
        assert!(matches!(result, Err(SandboxError::Config { .. })));
    }
}
