//! Call a script's exported function with JSON arguments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;

use scriptbox::ExecutionRequest;

use super::{print_result, read_script, report, Session};

/// Options for `scriptbox run`.
pub(crate) struct RunOptions {
    pub file: PathBuf,
    /// Inline JSON arguments, in order.
    pub args: Vec<String>,
    /// File holding a JSON array of leading arguments.
    pub args_file: Option<PathBuf>,
    pub no_console: bool,
    pub timeout_ms: Option<u64>,
    pub json: bool,
}

/// Builds the argument list: the array from `--args-file` (if any), then
/// every `--arg` value.
fn parse_args(inline: &[String], file: Option<&str>) -> Result<Vec<Value>> {
    let mut args = match file {
        Some(content) => match serde_json::from_str(content).context("Invalid --args-file")? {
            Value::Array(items) => items,
            other => bail!("--args-file must contain a JSON array, found {}", kind(&other)),
        },
        None => Vec::new(),
    };

    for raw in inline {
        let value = serde_json::from_str(raw)
            .with_context(|| format!("Invalid --arg value (expected JSON): {raw}"))?;
        args.push(value);
    }
    Ok(args)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn read_args_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read args file: {}", path.display()))
}

/// Runs the command. Returns false when the execution failed.
pub(crate) async fn run(session: &Session, options: RunOptions) -> Result<bool> {
    let script = read_script(&options.file)?;
    let file_args = options.args_file.as_deref().map(read_args_file).transpose()?;
    let args = parse_args(&options.args, file_args.as_deref())?;

    info!(file = %options.file.display(), args = args.len(), "running function");

    let mut request = ExecutionRequest::function(script, args).capture_console(!options.no_console);
    if let Some(ms) = options.timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }

    let result = session.execute(request).await?;
    print_result(&result, options.json, report::format_execution)?;
    Ok(result.is_completed())
}
