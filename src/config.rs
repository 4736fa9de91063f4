//! `scriptbox.toml` configuration.
//!
//! Every field has a serde default so a missing file, or a file that only
//! sets a couple of keys, is always a complete configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::sandbox::SandboxError;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "scriptbox.toml";

/// Contents of `scriptbox.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Label attached to every log event of the manager and its instances
    #[serde(default = "default_label")]
    pub label: String,
    /// `[runtime]` section.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// `[pool]` section.
    #[serde(default)]
    pub pool: PoolConfig,
    /// `[execution]` section.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label: default_label(),
            runtime: RuntimeConfig::default(),
            pool: PoolConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Isolated runtime (Deno) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path to the Deno executable
    /// - Default: "deno"
    /// - Custom: "/opt/deno/bin/deno"
    #[serde(default = "default_runtime_path")]
    pub path: String,

    /// V8 heap cap in megabytes
    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: u32,

    /// Extra arguments passed to `deno run`, parsed with shell quoting rules
    #[serde(default)]
    pub extra_args: String,

    /// Allow scripts to use the network (fetch, sockets)
    #[serde(default = "default_true")]
    pub allow_net: bool,

    /// Allow scripts to import remote modules (npm:, https:)
    #[serde(default = "default_true")]
    pub allow_import: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            path: default_runtime_path(),
            max_heap_mb: default_max_heap_mb(),
            extra_args: String::new(),
            allow_net: true,
            allow_import: true,
        }
    }
}

impl RuntimeConfig {
    /// Split `extra_args` into individual arguments.
    pub fn extra_args(&self) -> Result<Vec<String>, SandboxError> {
        shell_words::split(&self.extra_args)
            .map_err(|e| SandboxError::config(format!("runtime.extra_args: {e}")))
    }
}

/// Instance pool and supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of runtime processes
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// How long a process may take to signal readiness
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    /// Consecutive respawns allowed before an instance is stopped for good
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before respawning a crashed instance
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            boot_timeout_ms: default_boot_timeout_ms(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl PoolConfig {
    /// `boot_timeout_ms` as a `Duration`.
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    /// `restart_delay_ms` as a `Duration`.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Per-execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout applied when a request does not set its own
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Payloads at least this many bytes go through spill files
    #[serde(default = "default_large_payload_threshold")]
    pub large_payload_threshold: usize,

    /// Remove job directories, spill files and instance directories
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Prefix bare import specifiers with `node:` / `npm:`
    #[serde(default = "default_true")]
    pub rewrite_imports: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            large_payload_threshold: default_large_payload_threshold(),
            cleanup: true,
            rewrite_imports: true,
        }
    }
}

impl ExecutionConfig {
    /// `default_timeout_ms` as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_label() -> String {
    "sandbox".to_string()
}

fn default_runtime_path() -> String {
    "deno".to_string()
}

fn default_max_heap_mb() -> u32 {
    256
}

fn default_pool_size() -> usize {
    1
}

fn default_boot_timeout_ms() -> u64 {
    10_000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1_500
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_large_payload_threshold() -> usize {
    8 * 1024
}

impl Config {
    /// Load configuration from `scriptbox.toml` in `dir`, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_file(&dir.join(CONFIG_FILE), false)
    }

    /// Load configuration from an explicit path.
    ///
    /// With `required = false` a missing file yields the defaults.
    pub fn load_file(config_path: &Path, required: bool) -> Result<Self> {
        if !config_path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", config_path.display());
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Reject values the manager cannot run with.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.pool.size == 0 {
            return Err(SandboxError::config("pool.size must be at least 1"));
        }
        if self.pool.boot_timeout_ms == 0 {
            return Err(SandboxError::config(
                "pool.boot_timeout_ms must be greater than 0",
            ));
        }
        if self.runtime.path.trim().is_empty() {
            return Err(SandboxError::config("runtime.path must not be empty"));
        }
        self.runtime.extra_args()?;
        Ok(())
    }
}
