//! Launching runtime processes.
//!
//! The supervisor only sees a [`RuntimeProcess`]: two byte pipes and a handle
//! it can kill or wait on. [`DenoLauncher`] backs it with a real `deno run`
//! child; tests back it with in-memory pipes.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::workspace::InstanceWorkspace;
use super::SandboxError;
use crate::config::{Config, RuntimeConfig};
use crate::runtime;

/// Boxed writer feeding the runtime's stdin.
pub type RuntimeStdin = Box<dyn AsyncWrite + Send + Unpin>;
/// Boxed reader over one of the runtime's output streams.
pub type RuntimeOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A launched runtime process.
pub struct RuntimeProcess {
    /// Protocol commands go here.
    pub stdin: RuntimeStdin,
    /// Protocol events come from here.
    pub stdout: RuntimeOutput,
    /// Diagnostic output, forwarded to the log.
    pub stderr: Option<RuntimeOutput>,
    /// Kill and wait on the process.
    pub handle: Box<dyn ProcessHandle>,
}

/// Control over a launched process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Forcefully terminates the process and reaps it.
    async fn kill(&mut self) -> io::Result<()>;

    /// Waits for the process to exit, returning its exit code if it has one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Starts runtime processes for instances.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    /// Returns the launcher name for display.
    fn name(&self) -> &'static str;

    /// Launches one runtime process rooted at `workspace`.
    async fn launch(&self, workspace: &InstanceWorkspace) -> Result<RuntimeProcess, SandboxError>;
}

/// Launches `deno run host.mjs` with permissions scoped to the instance.
pub struct DenoLauncher {
    runtime: RuntimeConfig,
    large_payload_threshold: usize,
    cleanup: bool,
}

impl DenoLauncher {
    /// A launcher for the runtime described by `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            runtime: config.runtime.clone(),
            large_payload_threshold: config.execution.large_payload_threshold,
            cleanup: config.execution.cleanup,
        }
    }

    /// Arguments passed to the runtime binary.
    pub fn args(&self, workspace: &InstanceWorkspace) -> Result<Vec<String>, SandboxError> {
        let root = workspace.root.display();
        let heap = self.runtime.max_heap_mb;

        let mut args = vec![
            "run".to_string(),
            format!("--allow-read={root}"),
            format!("--allow-write={root}"),
            format!("--allow-env={}", ENV_KEYS.join(",")),
            "--no-prompt".to_string(),
            "--unstable-worker-options".to_string(),
            format!("--v8-flags=--max-heap-size={heap},--max-old-space-size={heap}"),
        ];

        if self.runtime.allow_net {
            args.push("--allow-net".to_string());
        }
        if self.runtime.allow_import {
            args.push("--allow-import".to_string());
        }

        args.extend(self.runtime.extra_args()?);
        args.push(workspace.root.join(runtime::HOST_FILE).display().to_string());
        Ok(args)
    }

    /// Environment handed to the runtime. Everything else is cleared.
    pub fn env(&self, workspace: &InstanceWorkspace) -> Vec<(String, String)> {
        let flag = |on: bool| String::from(if on { "1" } else { "0" });

        let mut env = vec![
            ("DENO_DIR".to_string(), workspace.deno_dir.display().to_string()),
            ("DENO_NO_PACKAGE_JSON".to_string(), "1".to_string()),
            ("DENO_NO_PROMPT".to_string(), "1".to_string()),
            ("DENO_NO_UPDATE_CHECK".to_string(), "1".to_string()),
            ("NO_COLOR".to_string(), "1".to_string()),
            ("SCRIPTBOX_IPC_DIR".to_string(), workspace.ipc_dir.display().to_string()),
            (
                "SCRIPTBOX_LARGE_PAYLOAD_THRESHOLD".to_string(),
                self.large_payload_threshold.to_string(),
            ),
            ("SCRIPTBOX_CLEANUP".to_string(), flag(self.cleanup)),
            ("SCRIPTBOX_ALLOW_NET".to_string(), flag(self.runtime.allow_net)),
            ("SCRIPTBOX_ALLOW_IMPORT".to_string(), flag(self.runtime.allow_import)),
        ];
        for key in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                env.push((key.to_string(), value));
            }
        }
        env
    }
}

/// Variables the host script is allowed to read.
const ENV_KEYS: &[&str] = &[
    "SCRIPTBOX_IPC_DIR",
    "SCRIPTBOX_LARGE_PAYLOAD_THRESHOLD",
    "SCRIPTBOX_CLEANUP",
    "SCRIPTBOX_ALLOW_NET",
    "SCRIPTBOX_ALLOW_IMPORT",
];

#[async_trait]
impl RuntimeLauncher for DenoLauncher {
    fn name(&self) -> &'static str {
        "Deno"
    }

    async fn launch(&self, workspace: &InstanceWorkspace) -> Result<RuntimeProcess, SandboxError> {
        runtime::install_host(&workspace.root).await?;
        let args = self.args(workspace)?;
        debug!("Deno args: {:?}", args);

        let mut child = Command::new(&self.runtime.path)
            .current_dir(&workspace.root)
            .args(&args)
            .env_clear()
            .envs(self.env(workspace))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::launch(&self.runtime.path, e.to_string()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxError::launch(
                &self.runtime.path,
                "runtime pipes were not captured",
            ));
        };
        let stderr = child.stderr.take().map(|s| Box::new(s) as RuntimeOutput);

        info!(pid = child.id(), "launched Deno runtime");

        Ok(RuntimeProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            handle: Box::new(ChildHandle(child)),
        })
    }
}

/// [`ProcessHandle`] over a tokio child process.
struct ChildHandle(Child);

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn kill(&mut self) -> io::Result<()> {
        match self.0.kill().await {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }
}

/// Runs `<path> --version` and returns the first line of its output.
pub async fn probe_runtime(path: &str) -> Result<String, SandboxError> {
    let output = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SandboxError::launch(path, e.to_string()))?;

    if !output.status.success() {
        return Err(SandboxError::launch(
            path,
            format!("--version exited with {:?}", output.status.code()),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}
