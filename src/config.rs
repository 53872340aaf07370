//! Runner configuration
//!
//! Defaults for every execution, loaded from the environment at start.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::executor::local::DEFAULT_PATH;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Default run timeout (default: 10s)
    pub execution_timeout: Duration,
    /// Compile step timeout (default: 30s)
    pub compile_timeout: Duration,
    /// Default memory ceiling for the run step in MB (default: 256MB)
    pub max_memory_mb: u32,
    /// Memory ceiling for the compile step in MB (default: 2048MB)
    pub compile_memory_mb: u32,
    /// Per-stream output cap in bytes (default: 10000)
    pub max_output_bytes: usize,
    /// Scratch directory holding execution directories
    pub scratch_dir: PathBuf,
    /// `PATH` handed to child processes
    pub execution_path: String,
    /// Alternative languages table; `None` uses the built-in one
    pub languages_config: Option<PathBuf>,
    /// Worker-side parallelism (default: 4)
    pub max_concurrent_executions: usize,
    /// Age after which leftover execution directories are swept (default: 1h)
    pub stale_artifact_age: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(10),
            compile_timeout: Duration::from_secs(30),
            max_memory_mb: 256,
            compile_memory_mb: 2048,
            max_output_bytes: 10_000,
            scratch_dir: std::env::temp_dir().join("code-runner"),
            execution_path: DEFAULT_PATH.to_string(),
            languages_config: None,
            max_concurrent_executions: 4,
            stale_artifact_age: Duration::from_secs(3600),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let execution_timeout = parse_or(&lookup, "EXECUTION_TIMEOUT", 10u64)?;
        if execution_timeout == 0 {
            bail!("EXECUTION_TIMEOUT must be greater than 0");
        }
        let compile_timeout = parse_or(&lookup, "COMPILE_TIMEOUT", 30u64)?;
        if compile_timeout == 0 {
            bail!("COMPILE_TIMEOUT must be greater than 0");
        }

        let max_concurrent_executions = parse_or(
            &lookup,
            "MAX_CONCURRENT_EXECUTIONS",
            defaults.max_concurrent_executions,
        )?
        .max(1);

        Ok(Self {
            execution_timeout: Duration::from_secs(execution_timeout),
            compile_timeout: Duration::from_secs(compile_timeout),
            max_memory_mb: parse_or(&lookup, "MAX_MEMORY_MB", defaults.max_memory_mb)?,
            compile_memory_mb: parse_or(&lookup, "COMPILE_MEMORY_MB", defaults.compile_memory_mb)?,
            max_output_bytes: parse_or(&lookup, "MAX_OUTPUT_SIZE", defaults.max_output_bytes)?,
            scratch_dir: non_empty(&lookup, "TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            execution_path: non_empty(&lookup, "EXECUTION_PATH").unwrap_or(defaults.execution_path),
            languages_config: non_empty(&lookup, "LANGUAGES_CONFIG").map(PathBuf::from),
            max_concurrent_executions,
            stale_artifact_age: Duration::from_secs(parse_or(
                &lookup,
                "STALE_ARTIFACT_SECS",
                3600u64,
            )?),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
