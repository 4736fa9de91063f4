//! Instance-scoped directories.
//!
//! ```text
//! <work_dir>/sandbox/instance-<n>/
//!   host.mjs        runtime entry point
//!   deno_dir/       module cache (DENO_DIR)
//!   jobs/<job-id>/  script.mjs + worker.mjs, readable/writable by the job
//!   ipc/            large argument and result spill files
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::protocol::now_millis;

use super::SandboxError;

/// Directory under the work dir that holds every instance.
pub const SANDBOX_DIR: &str = "sandbox";

/// Directory layout of one instance. No two instances share a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceWorkspace {
    /// `sandbox/instance-N`.
    pub root: PathBuf,
    /// One subdirectory per running job.
    pub jobs_dir: PathBuf,
    /// Spill files for large arguments and results.
    pub ipc_dir: PathBuf,
    /// Module cache of this instance's runtime.
    pub deno_dir: PathBuf,
}

impl InstanceWorkspace {
    /// Layout for slot `index` under `work_dir`.
    pub fn new(work_dir: &Path, index: usize) -> Self {
        let root = work_dir.join(SANDBOX_DIR).join(format!("instance-{index}"));
        Self {
            jobs_dir: root.join("jobs"),
            ipc_dir: root.join("ipc"),
            deno_dir: root.join("deno_dir"),
            root,
        }
    }

    /// Creates the directory tree and removes spill files left by a dead process.
    pub async fn prepare(&self) -> Result<(), SandboxError> {
        for dir in [&self.root, &self.jobs_dir, &self.ipc_dir, &self.deno_dir] {
            fs::create_dir_all(dir).await?;
        }
        let removed = self.clear_spills().await?;
        if removed > 0 {
            debug!(removed, "removed orphaned spill files");
        }
        Ok(())
    }

    /// Writes a large argument list to the ipc directory and returns its file name.
    pub async fn spill_args(&self, job_id: &str, json: &str) -> Result<String, SandboxError> {
        let file = format!("{}.{job_id}.input.json", now_millis());
        fs::write(self.ipc_dir.join(&file), json).await?;
        Ok(file)
    }

    /// Reads a spill file written by the runtime.
    pub async fn read_spill(&self, file: &str, remove: bool) -> Result<String, SandboxError> {
        let path = self.spill_path(file)?;
        let content = fs::read_to_string(&path).await?;
        if remove {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(file, error = %e, "failed to remove spill file");
            }
        }
        Ok(content)
    }

    /// Resolves a runtime-supplied spill file name inside the ipc directory.
    fn spill_path(&self, file: &str) -> Result<PathBuf, SandboxError> {
        if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
            return Err(SandboxError::transport(format!(
                "runtime referenced an invalid spill file: {file}"
            )));
        }
        Ok(self.ipc_dir.join(file))
    }

    /// Removes every file in the ipc directory, returning how many were removed.
    pub async fn clear_spills(&self) -> Result<usize, SandboxError> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.ipc_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes one job's directory. Missing directories are not an error.
    pub async fn remove_job(&self, job_id: &str) {
        let dir = self.jobs_dir.join(job_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, error = %e, "failed to remove job directory"),
        }
    }

    /// Removes the whole instance directory.
    pub async fn remove(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(root = %self.root.display(), "removed instance directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %self.root.display(), error = %e, "failed to remove instance directory"),
        }
    }
}
