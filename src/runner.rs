//! CodeRunner - public execution facade
//!
//! Validates the requested language, hands the request to a [`Sandbox`] and
//! collapses the session report into an [`ExecutionOutcome`] with exactly one
//! [`ExecutionStatus`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::error::SandboxError;
use crate::executor::{LocalRunner, ProcessRunner};
use crate::languages::LanguageRegistry;
use crate::sandbox::{Sandbox, SessionLimits, SessionReport, Stage};

/// Classified result of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    MemoryExceeded,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::MemoryExceeded => "memory_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// One execution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language_id: String,
    pub stdin: Option<String>,
    /// Overrides the configured run timeout
    pub timeout: Option<Duration>,
    /// Overrides the configured memory ceiling; `Some(0)` disables it
    pub max_memory_mb: Option<u32>,
    /// Overrides the configured output cap
    pub max_output_bytes: Option<usize>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language_id: language_id.into(),
            stdin: None,
            timeout: None,
            max_memory_mb: None,
            max_output_bytes: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u32) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }
}

/// Result of one execution as handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "returncode")]
    pub exit_code: Option<i32>,
    status: ExecutionStatus,
    #[serde(rename = "timeout")]
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// Sandbox failure: unsupported language, spawn error, internal error
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Wall-clock seconds of the run step (0 when it never ran)
    pub execution_time: f64,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peak_memory_kb: Option<u64>,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    fn failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            status: ExecutionStatus::Error,
            timed_out: false,
            memory_exceeded: false,
            error: Some(message),
            execution_time: 0.0,
            stdout_truncated: false,
            stderr_truncated: false,
            peak_memory_kb: None,
        }
    }

    /// Outcome for a language the registry does not know
    pub fn unsupported(language: &str) -> Self {
        Self::failed(SandboxError::UnsupportedLanguage(language.to_string()).to_string())
    }

    /// Outcome for a failure inside the runner itself
    pub fn internal_error(message: impl fmt::Display) -> Self {
        Self::failed(format!("internal error: {}", message))
    }

    fn from_report(report: SessionReport) -> Self {
        let status = classify(&report);
        let execution_time = match report.stage {
            Stage::Run => report.outcome.elapsed.as_secs_f64(),
            Stage::Compile | Stage::None => 0.0,
        };
        let outcome = report.outcome;

        Self {
            stdout: outcome.stdout_lossy(),
            stderr: outcome.stderr_lossy(),
            exit_code: outcome.exit_code,
            status,
            timed_out: outcome.timed_out,
            memory_exceeded: outcome.memory_exceeded,
            error: report.error,
            execution_time,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
            peak_memory_kb: outcome.peak_memory_kb,
        }
    }
}

/// Status precedence: error > timeout > memory_exceeded > success.
///
/// A failed compile counts as an error; a non-zero exit of the run step does not.
pub fn classify(report: &SessionReport) -> ExecutionStatus {
    if report.error.is_some() || report.compile_failed() {
        ExecutionStatus::Error
    } else if report.outcome.timed_out {
        ExecutionStatus::Timeout
    } else if report.outcome.memory_exceeded {
        ExecutionStatus::MemoryExceeded
    } else {
        ExecutionStatus::Success
    }
}

/// Entry point for running submitted code
pub struct CodeRunner {
    registry: Arc<LanguageRegistry>,
    sandbox: Arc<Sandbox>,
    config: RunnerConfig,
}

impl CodeRunner {
    /// Runner spawning real processes with the configured `PATH`
    pub fn new(registry: Arc<LanguageRegistry>, config: RunnerConfig) -> Self {
        let process_runner = Arc::new(LocalRunner::new(config.execution_path.clone()));
        Self::with_process_runner(registry, config, process_runner)
    }

    pub fn with_process_runner(
        registry: Arc<LanguageRegistry>,
        config: RunnerConfig,
        process_runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let sandbox = Arc::new(Sandbox::new(process_runner, config.scratch_dir.clone()));
        Self {
            registry,
            sandbox,
            config,
        }
    }

    /// Run `code` with the configured defaults
    pub async fn execute(&self, code: &str, language: &str, stdin: Option<&str>) -> ExecutionOutcome {
        let mut request = ExecutionRequest::new(code, language);
        request.stdin = stdin.map(str::to_string);
        self.run(request).await
    }

    pub async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let Some(language) = self.registry.lookup(&request.language_id) else {
            warn!("Rejected unsupported language: {:?}", request.language_id);
            return ExecutionOutcome::unsupported(&request.language_id);
        };

        let limits = self.session_limits(&request);
        info!(
            "Executing {} source ({} bytes, timeout {:?})",
            language.id,
            request.source_code.len(),
            limits.run_timeout
        );

        // Own task so a panic inside the session becomes an outcome.
        let sandbox = Arc::clone(&self.sandbox);
        let session = tokio::spawn(async move {
            sandbox
                .execute(
                    &language,
                    &request.source_code,
                    request.stdin.as_deref(),
                    &limits,
                )
                .await
        });

        match session.await {
            Ok(report) => {
                let outcome = ExecutionOutcome::from_report(report);
                info!(
                    "Execution finished: status={}, exit_code={:?}, time={:.3}s",
                    outcome.status, outcome.exit_code, outcome.execution_time
                );
                outcome
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("Execution session panicked: {}", message);
                ExecutionOutcome::internal_error(message)
            }
            Err(e) => {
                error!("Execution session failed: {}", e);
                ExecutionOutcome::internal_error(e)
            }
        }
    }

    fn session_limits(&self, request: &ExecutionRequest) -> SessionLimits {
        let run_memory_mb = request.max_memory_mb.unwrap_or(self.config.max_memory_mb);
        SessionLimits {
            run_timeout: request
                .timeout
                .filter(|t| !t.is_zero())
                .unwrap_or(self.config.execution_timeout),
            compile_timeout: self.config.compile_timeout,
            run_memory_mb: (run_memory_mb > 0).then_some(run_memory_mb),
            compile_memory_mb: (self.config.compile_memory_mb > 0)
                .then_some(self.config.compile_memory_mb),
            max_output_bytes: request
                .max_output_bytes
                .unwrap_or(self.config.max_output_bytes),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
