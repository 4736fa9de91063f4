use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scriptbox::Config;

mod commands;
mod templates;

use commands::Session;

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(
    author,
    version,
    about = "Run untrusted JavaScript extractors and crawlers in an isolated Deno sandbox"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory that holds sandbox instance directories
    #[arg(long, global = true, env = "SCRIPTBOX_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Config file (default: ./scriptbox.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Deno binary, overriding the config file
    #[arg(long, global = true, env = "SCRIPTBOX_RUNTIME")]
    runtime: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a script's exported function with JSON arguments
    Run {
        /// Script file
        file: PathBuf,

        /// JSON argument (repeatable, passed in order)
        #[arg(short, long = "arg", value_name = "JSON")]
        args: Vec<String>,

        /// File with a JSON array of arguments, passed before any --arg
        #[arg(long)]
        args_file: Option<PathBuf>,

        /// Discard console output instead of capturing it
        #[arg(long)]
        no_console: bool,

        /// Execution timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a script as a module
    Exec {
        /// Script file
        file: PathBuf,

        /// Execution timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the test cases a script registers
    Test {
        /// Script file
        file: PathBuf,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the configured runtime is installed
    Check,

    /// Write a default scriptbox.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Remove sandbox directories left under the work dir
    Clean,
}

/// Default work dir: the user cache dir, falling back to the temp dir.
fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("scriptbox")
}

fn work_dir(cli: &Cli) -> PathBuf {
    cli.work_dir.clone().unwrap_or_else(default_work_dir)
}

/// Resolves the config (file, then CLI overrides) and work dir.
fn open_session(cli: &Cli) -> Result<Session> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(Session {
        config: load_config(cli, &cwd)?,
        work_dir: work_dir(cli),
    })
}

fn load_config(cli: &Cli, cwd: &Path) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_file(path, true)?,
        None => Config::load(cwd)?,
    };
    if let Some(runtime) = &cli.runtime {
        config.runtime.path.clone_from(runtime);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging. Logs go to stderr so stdout stays clean for --json.
    let filter = if cli.verbose {
        EnvFilter::new("scriptbox=debug")
    } else {
        EnvFilter::new("scriptbox=info")
    };

    let (text_layer, json_layer) = match cli.log_format {
        LogFormat::Text => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };
    let (file_layer, _log_guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scriptbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .with(filter)
        .init();

    let ok = match &cli.command {
        Commands::Init { force } => {
            commands::init::run(*force)?;
            true
        }
        Commands::Clean => {
            commands::clean::run(&work_dir(&cli))?;
            true
        }
        Commands::Check => commands::check::run(&open_session(&cli)?).await?,
        Commands::Run {
            file,
            args,
            args_file,
            no_console,
            timeout_ms,
            json,
        } => {
            let options = commands::run::RunOptions {
                file: file.clone(),
                args: args.clone(),
                args_file: args_file.clone(),
                no_console: *no_console,
                timeout_ms: *timeout_ms,
                json: *json,
            };
            commands::run::run(&open_session(&cli)?, options).await?
        }
        Commands::Exec {
            file,
            timeout_ms,
            json,
        } => commands::exec::run(&open_session(&cli)?, file.clone(), *timeout_ms, *json).await?,
        Commands::Test { file, json } => {
            commands::test::run(&open_session(&cli)?, file.clone(), *json).await?
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
