//! Write a default `scriptbox.toml` into the current directory.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;
use tracing::info;

use scriptbox::config::CONFIG_FILE;

use crate::templates;

/// What `init` did with the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Overwritten,
    /// Already present and `--force` was not given.
    Kept,
}

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing scriptbox in {}", cwd.display());

    let outcome = write_config(&cwd, force)?;
    print!("{}", format_outcome(outcome));
    Ok(())
}

fn write_config(dir: &Path, force: bool) -> Result<Outcome> {
    let path = dir.join(CONFIG_FILE);
    let existed = path.exists();
    if existed && !force {
        return Ok(Outcome::Kept);
    }

    std::fs::write(&path, templates::SCRIPTBOX_TOML)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(if existed {
        Outcome::Overwritten
    } else {
        Outcome::Created
    })
}

fn format_outcome(outcome: Outcome) -> String {
    let mut out = match outcome {
        Outcome::Created => format!(
            "\n{} scriptbox initialized successfully! Wrote {}\n",
            "✓".green().bold(),
            CONFIG_FILE.cyan()
        ),
        Outcome::Overwritten => format!(
            "\n{} scriptbox initialized successfully! {} (overwritten)\n",
            "↻".blue().bold(),
            CONFIG_FILE.cyan()
        ),
        Outcome::Kept => format!(
            "\n{} {CONFIG_FILE} already exists, use --force to overwrite\n",
            "⊘".yellow()
        ),
    };

    if outcome != Outcome::Kept {
        writeln!(
            &mut out,
            "\n{} run {} to verify the Deno runtime",
            "Next:".yellow().bold(),
            "scriptbox check".green()
        )
        .unwrap();
    }
    out
}
