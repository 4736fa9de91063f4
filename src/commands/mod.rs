//! CLI command implementations.
//!
//! Each submodule implements one scriptbox command with pure core logic
//! (planning, formatting) separated from IO for testability.

pub mod check;
pub mod clean;
pub mod exec;
pub mod init;
pub mod report;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scriptbox::{Config, ExecutionRequest, ExecutionResult, SandboxManager};
use tracing::debug;

/// Where and how commands run scripts.
pub(crate) struct Session {
    pub work_dir: PathBuf,
    pub config: Config,
}

impl Session {
    /// Runs one request on a fresh manager, shutting it down afterwards.
    pub(crate) async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let manager = SandboxManager::new(&self.work_dir, self.config.clone())
            .context("Failed to start sandbox")?;

        let outcome = async {
            manager.wait_for_ready().await?;
            manager.execute_buffered(request).await
        }
        .await;
        manager.shutdown().await;

        let result = outcome.with_context(|| {
            format!(
                "Sandbox runtime '{}' is not usable (try `scriptbox check`)",
                self.config.runtime.path
            )
        })?;
        debug!(status = %result.status(), messages = result.messages.len(), "execution finished");
        Ok(result)
    }
}

/// Reads a script file given on the command line.
pub(crate) fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script: {}", path.display()))
}

/// Prints a result either as JSON or through `format`.
pub(crate) fn print_result<F>(result: &ExecutionResult, json: bool, format: F) -> Result<()>
where
    F: FnOnce(&ExecutionResult) -> String,
{
    if json {
        let out = serde_json::to_string_pretty(result).context("Failed to encode result")?;
        println!("{out}");
    } else {
        print!("{}", format(result));
    }
    Ok(())
}
