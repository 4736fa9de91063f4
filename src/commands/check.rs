//! Report whether the configured runtime can be launched.

use std::fmt::Write;
use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use scriptbox::sandbox::probe_runtime;
use scriptbox::{Config, SandboxError};

use super::Session;

/// Formats the probe outcome together with the effective settings.
fn format_check(config: &Config, work_dir: &Path, probe: &Result<String, SandboxError>) -> String {
    let mut out = String::new();

    match probe {
        Ok(version) => {
            writeln!(&mut out, "\n{} Runtime found: {}", "✓".green().bold(), version.cyan()).unwrap();
        }
        Err(e) => {
            writeln!(&mut out, "\n{} Runtime not usable: {}", "✗".red().bold(), e).unwrap();
            writeln!(
                &mut out,
                "  Install Deno or set {} / {} in {}",
                "SCRIPTBOX_RUNTIME".cyan(),
                "[runtime] path".cyan(),
                "scriptbox.toml".cyan()
            )
            .unwrap();
        }
    }

    writeln!(&mut out, "  Runtime:    {}", config.runtime.path.cyan()).unwrap();
    writeln!(&mut out, "  Work dir:   {}", work_dir.display().to_string().cyan()).unwrap();
    writeln!(&mut out, "  Pool size:  {}", config.pool.size.to_string().cyan()).unwrap();
    writeln!(
        &mut out,
        "  Timeout:    {}",
        format!("{} ms", config.execution.default_timeout_ms).cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Network:    {}",
        if config.runtime.allow_net { "allowed".green() } else { "denied".yellow() }
    )
    .unwrap();

    out
}

/// Runs the command. Returns false when the runtime is missing.
pub(crate) async fn run(session: &Session) -> Result<bool> {
    let probe = probe_runtime(&session.config.runtime.path).await;
    print!("{}", format_check(&session.config, &session.work_dir, &probe));
    Ok(probe.is_ok())
}
