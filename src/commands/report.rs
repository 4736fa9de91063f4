//! Human-readable rendering of execution results.
//!
//! Everything here is pure: it takes a result and returns a string.

use std::fmt::Write;

use colored::Colorize;
use scriptbox::{ExecutionResult, ExecutionStatus, LogLevel, TestStatus};

/// Console output, exceptions, the result value and the final status.
pub fn format_execution(result: &ExecutionResult) -> String {
    let mut out = String::new();
    write_logs(&mut out, result);
    write_exceptions(&mut out, result);

    if let Some(value) = &result.result {
        let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        writeln!(&mut out, "\n{}", "Result:".bold()).unwrap();
        writeln!(&mut out, "{pretty}").unwrap();
    }

    write_status(&mut out, result);
    out
}

/// Per-case test results followed by a summary line.
pub fn format_tests(result: &ExecutionResult) -> String {
    let mut out = String::new();
    write_logs(&mut out, result);

    let (mut passed, mut failed, mut skipped) = (0, 0, 0);
    writeln!(&mut out, "\n{}", "Tests:".bold()).unwrap();
    for test in result.tests() {
        match test.status {
            TestStatus::Running => {}
            TestStatus::Passed => {
                passed += 1;
                writeln!(
                    &mut out,
                    "  {} {} {}",
                    "✓".green(),
                    test.name,
                    format!("({} ms)", test.duration).dimmed()
                )
                .unwrap();
            }
            TestStatus::Failed => {
                failed += 1;
                writeln!(&mut out, "  {} {}", "✗".red(), test.name).unwrap();
                if !test.message.is_empty() {
                    writeln!(&mut out, "      {}", test.message.red()).unwrap();
                }
            }
            TestStatus::Skipped => {
                skipped += 1;
                writeln!(&mut out, "  {} {} (skipped)", "⊘".yellow(), test.name.dimmed()).unwrap();
            }
        }
    }

    writeln!(
        &mut out,
        "\n{} passed, {} failed, {} skipped",
        passed.to_string().green(),
        failed.to_string().red(),
        skipped.to_string().yellow()
    )
    .unwrap();

    write_exceptions(&mut out, result);
    write_status(&mut out, result);
    out
}

/// True when a test run completed and no case failed.
pub fn tests_passed(result: &ExecutionResult) -> bool {
    result.is_completed()
        && result
            .tests()
            .iter()
            .all(|test| test.status != TestStatus::Failed)
}

fn write_logs(out: &mut String, result: &ExecutionResult) {
    for (level, text) in result.logs() {
        let tag = match level {
            LogLevel::Log => "[log]".dimmed(),
            LogLevel::Info => "[info]".blue(),
            LogLevel::Warn => "[warn]".yellow(),
            LogLevel::Error => "[error]".red(),
            LogLevel::Debug => "[debug]".dimmed(),
        };
        writeln!(out, "{tag} {text}").unwrap();
    }
}

fn write_exceptions(out: &mut String, result: &ExecutionResult) {
    for exception in result.exceptions() {
        writeln!(out, "{} {}", "✗".red(), exception.to_string().red()).unwrap();
    }
}

fn write_status(out: &mut String, result: &ExecutionResult) {
    match result.status() {
        ExecutionStatus::Completed => {
            writeln!(out, "\n{} Execution completed", "✓".green().bold()).unwrap();
        }
        status => {
            let reason = result.error().unwrap_or("no reason given");
            writeln!(out, "\n{} Execution {status}: {reason}", "✗".red().bold()).unwrap();
        }
    }
}
