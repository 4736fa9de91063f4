//! Evaluate a script as a module.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use scriptbox::ExecutionRequest;

use super::{print_result, read_script, report, Session};

/// Runs the command. Returns false when the execution failed.
pub(crate) async fn run(
    session: &Session,
    file: PathBuf,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<bool> {
    let script = read_script(&file)?;
    info!(file = %file.display(), "evaluating module");

    let mut request = ExecutionRequest::module(script);
    if let Some(ms) = timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }

    let result = session.execute(request).await?;
    print_result(&result, json, report::format_execution)?;
    Ok(result.is_completed())
}
