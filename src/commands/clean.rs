//! Remove leftover sandbox directories.
//!
//! Core logic determines what to remove based on existence.
//! Formatting is pure. IO happens only at the top level.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use scriptbox::sandbox::SANDBOX_DIR;

/// Directories under `work_dir` that `clean` removes.
pub fn sandbox_dirs(work_dir: &Path) -> Vec<PathBuf> {
    vec![work_dir.join(SANDBOX_DIR)]
}

/// Removes every existing sandbox directory and returns the removed paths.
pub fn clean_dirs<E, R>(work_dir: &Path, exists: E, mut remove: R) -> Result<Vec<PathBuf>>
where
    E: Fn(&Path) -> bool,
    R: FnMut(&Path) -> Result<()>,
{
    let mut removed = Vec::new();
    for dir in sandbox_dirs(work_dir).into_iter().filter(|d| exists(d)) {
        remove(&dir)?;
        removed.push(dir);
    }
    Ok(removed)
}

/// Format the clean results as a displayable string
pub fn format_results(removed: &[PathBuf]) -> String {
    let mut out = String::new();
    if removed.is_empty() {
        writeln!(&mut out, "\n{} No sandbox directories found to clean.", "ℹ".blue()).unwrap();
    } else {
        writeln!(&mut out, "\n{} Cleaned sandbox directories:", "✓".green()).unwrap();
        for dir in removed {
            writeln!(
                &mut out,
                "  {} {}",
                "✗".red(),
                dir.display().to_string().dimmed()
            )
            .unwrap();
        }
    }
    out
}

/// Entry point: runs clean against the real filesystem.
pub fn run(work_dir: &Path) -> Result<()> {
    let removed = clean_dirs(
        work_dir,
        Path::exists,
        |dir| {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))
        },
    )?;

    print!("{}", format_results(&removed));
    Ok(())
}
