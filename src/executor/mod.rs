//! Executor module - process execution abstraction
//!
//! This module runs exactly one OS process per call:
//! - Spawns it in the artifact's working directory
//! - Enforces a wall-clock timeout and an optional memory ceiling
//! - Captures stdout/stderr, each capped at a byte limit
//!
//! The executor module does NOT:
//! - Know about languages, templates or compilation order
//! - Classify outcomes into statuses

pub mod local;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: PathBuf::from("."),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Resource limits for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock limit from spawn to exit
    pub timeout: Duration,
    /// Resident memory ceiling of the whole process group, in MB
    pub memory_limit_mb: Option<u32>,
    /// Cap applied independently to stdout and stderr
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub fn new(timeout: Duration, memory_limit_mb: Option<u32>, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            memory_limit_mb,
            max_output_bytes,
        }
    }
}

/// Outcome of one child process (raw, no status interpretation).
///
/// Output truncation is a hard byte cutoff: a multi-byte UTF-8 sequence may be
/// split at the boundary. Timeout and memory messages are appended to `stderr`
/// after truncation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Exit code, or the negated signal number when killed by a signal.
    /// Absent on timeout, memory breach and spawn failure.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// Highest resident memory sampled for the process group
    pub peak_memory_kb: Option<u64>,
    /// The process could not be started (or waited on); not a program failure
    pub spawn_error: Option<String>,
    /// Wall-clock time from spawn to exit or kill
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Exited on its own with code 0
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.memory_exceeded
    }

    /// Exited on its own with a non-zero code
    pub fn is_failure_exit(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub(crate) fn append_stderr_line(&mut self, message: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with(b"\n") {
            self.stderr.push(b'\n');
        }
        self.stderr.extend_from_slice(message.as_bytes());
    }
}

/// Runner trait for executing one process
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command with the given limits and optional stdin.
    ///
    /// Never fails: spawn problems are reported in `ProcessOutcome::spawn_error`.
    async fn run(&self, cmd: &CommandSpec, limits: &RunLimits, stdin: Option<&str>)
        -> ProcessOutcome;
}

// Re-exports
pub use local::LocalRunner;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_from_vec() {
        let cmd = CommandSpec::from_vec(&["javac".to_string(), "Main.java".to_string()])
            .with_work_dir("/tmp/exec-1");

        assert_eq!(cmd.program, "javac");
        assert_eq!(cmd.args, vec!["Main.java"]);
        assert_eq!(cmd.to_vec(), vec!["javac", "Main.java"]);
        assert_eq!(cmd.work_dir, PathBuf::from("/tmp/exec-1"));
    }

    #[test]
    fn test_append_stderr_line() {
        let mut outcome = ProcessOutcome {
            stderr: b"partial".to_vec(),
            ..Default::default()
        };
        outcome.append_stderr_line("Execution timeout after 1 seconds");
        assert_eq!(outcome.stderr_lossy(), "partial\nExecution timeout after 1 seconds");

        let mut empty = ProcessOutcome::default();
        empty.append_stderr_line("boom");
        assert_eq!(empty.stderr_lossy(), "boom");
    }

    #[test]
    fn test_outcome_predicates() {
        let ok = ProcessOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        let failed = ProcessOutcome {
            exit_code: Some(2),
            ..Default::default()
        };
        let spawn = ProcessOutcome::spawn_failure("no such file");

        assert!(ok.is_success() && !ok.is_failure_exit());
        assert!(!failed.is_success() && failed.is_failure_exit());
        assert!(!spawn.is_success() && !spawn.is_failure_exit());
    }
}
