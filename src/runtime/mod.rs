//! JavaScript assets that run inside the isolated runtime.
//!
//! - `host.mjs` is the long-lived process entry point (one per instance).
//! - `bootstrap.mjs` + `harness.mjs` are concatenated into each job's worker
//!   module, followed by a `runJob` call carrying the job options.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::execution::ExecutionMode;

pub(crate) const HOST_SCRIPT: &str = include_str!("host.mjs");
pub(crate) const BOOTSTRAP_SCRIPT: &str = include_str!("bootstrap.mjs");
pub(crate) const HARNESS_SCRIPT: &str = include_str!("harness.mjs");

/// File name of the host entry point inside an instance directory.
pub const HOST_FILE: &str = "host.mjs";
/// File name of the user script inside a job directory.
pub const SCRIPT_FILE: &str = "script.mjs";
/// File name of the composed worker module inside a job directory.
pub const WORKER_FILE: &str = "worker.mjs";

/// Options passed to `runJob` in the worker module.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerOptions<'a> {
    job_id: &'a str,
    mode: &'static str,
    capture_console: bool,
    script: String,
}

/// Files written for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    /// The job directory.
    pub dir: PathBuf,
    /// Worker entry module inside it.
    pub worker_file: PathBuf,
}

/// Writes the host entry point into `dir`, returning its path.
pub async fn install_host(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join(HOST_FILE);
    fs::write(&path, HOST_SCRIPT).await?;
    Ok(path)
}

/// Builds the worker module for one job.
pub fn compose_worker_module(
    job_id: &str,
    mode: &ExecutionMode,
    capture_console: bool,
) -> Result<String, serde_json::Error> {
    let options = WorkerOptions {
        job_id,
        mode: mode.as_str(),
        capture_console,
        script: format!("./{SCRIPT_FILE}"),
    };
    let options = serde_json::to_string(&options)?;
    Ok(format!(
        "{BOOTSTRAP_SCRIPT}\n{HARNESS_SCRIPT}\nawait runJob({options});\n"
    ))
}

/// Writes the user script and the worker module into `jobs_dir/<job_id>/`.
pub async fn write_job(
    jobs_dir: &Path,
    job_id: &str,
    script: &str,
    mode: &ExecutionMode,
    capture_console: bool,
) -> std::io::Result<JobFiles> {
    let dir = jobs_dir.join(job_id);
    fs::create_dir_all(&dir).await?;

    let module = compose_worker_module(job_id, mode, capture_console)?;
    let worker_file = dir.join(WORKER_FILE);
    fs::write(dir.join(SCRIPT_FILE), script).await?;
    fs::write(&worker_file, module).await?;

    Ok(JobFiles { dir, worker_file })
}
