//! Sandbox - one execution session
//!
//! Drives a single request through
//! `Materializing -> Compiling (optional) -> Running -> CleaningUp -> Done`.
//! The artifact directory is owned by the session and released on every path;
//! a compile step that exits non-zero ends the session with the compiler's outcome.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::executor::{CommandSpec, ProcessOutcome, ProcessRunner, RunLimits};
use crate::languages::{CommandTemplate, LanguageSpec};
use crate::materializer::{Artifact, SourceMaterializer};

/// Session states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Materializing,
    Compiling,
    Running,
    CleaningUp,
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Materializing => "materializing",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::CleaningUp => "cleaning_up",
            SessionState::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Step whose process outcome became the session result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing was spawned (materialization failed)
    None,
    Compile,
    Run,
}

/// Limits for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLimits {
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    pub run_memory_mb: Option<u32>,
    pub compile_memory_mb: Option<u32>,
    pub max_output_bytes: usize,
}

impl SessionLimits {
    fn for_compile(&self) -> RunLimits {
        RunLimits::new(
            self.compile_timeout,
            self.compile_memory_mb,
            self.max_output_bytes,
        )
    }

    fn for_run(&self) -> RunLimits {
        RunLimits::new(self.run_timeout, self.run_memory_mb, self.max_output_bytes)
    }
}

/// Result of one session
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Outcome of the last step that ran
    pub outcome: ProcessOutcome,
    pub stage: Stage,
    /// Sandbox failure (materialization, spawn); not set for program failures
    pub error: Option<String>,
}

impl SessionReport {
    fn failed(error: String) -> Self {
        Self {
            outcome: ProcessOutcome::default(),
            stage: Stage::None,
            error: Some(error),
        }
    }

    fn from_step(stage: Stage, outcome: ProcessOutcome) -> Self {
        let error = outcome.spawn_error.clone();
        Self {
            outcome,
            stage,
            error,
        }
    }

    /// The compile step ended the session with a non-zero exit
    pub fn compile_failed(&self) -> bool {
        self.stage == Stage::Compile && self.outcome.is_failure_exit()
    }
}

/// Orchestrates materialize -> compile -> run -> cleanup
pub struct Sandbox {
    runner: Arc<dyn ProcessRunner>,
    materializer: SourceMaterializer,
}

impl Sandbox {
    pub fn new(runner: Arc<dyn ProcessRunner>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            materializer: SourceMaterializer::new(scratch_dir),
        }
    }

    /// Run one source through its language's toolchain
    pub async fn execute(
        &self,
        language: &LanguageSpec,
        source: &str,
        stdin: Option<&str>,
        limits: &SessionLimits,
    ) -> SessionReport {
        trace_state(SessionState::Materializing, &language.id);
        let artifact = match self.materializer.materialize(source, language).await {
            Ok(artifact) => artifact,
            Err(e) => {
                trace_state(SessionState::Done, &language.id);
                return SessionReport::failed(e.to_string());
            }
        };

        let report = self.run_steps(&artifact, language, stdin, limits).await;

        trace_state(SessionState::CleaningUp, &language.id);
        artifact.cleanup();
        trace_state(SessionState::Done, &language.id);

        info!(
            "Session finished: language={}, stage={:?}, exit_code={:?}, timed_out={}, memory_exceeded={}",
            language.id,
            report.stage,
            report.outcome.exit_code,
            report.outcome.timed_out,
            report.outcome.memory_exceeded
        );

        report
    }

    async fn run_steps(
        &self,
        artifact: &Artifact,
        language: &LanguageSpec,
        stdin: Option<&str>,
        limits: &SessionLimits,
    ) -> SessionReport {
        if let Some(compile) = language.compile_template() {
            trace_state(SessionState::Compiling, &language.id);
            let outcome = self
                .spawn(compile, artifact, &limits.for_compile(), None)
                .await;

            if !outcome.is_success() {
                debug!(
                    "Compilation ended the session (exit_code={:?})",
                    outcome.exit_code
                );
                return SessionReport::from_step(Stage::Compile, outcome);
            }
        }

        trace_state(SessionState::Running, &language.id);
        let outcome = self
            .spawn(language.run_template(), artifact, &limits.for_run(), stdin)
            .await;
        SessionReport::from_step(Stage::Run, outcome)
    }

    async fn spawn(
        &self,
        template: &CommandTemplate,
        artifact: &Artifact,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> ProcessOutcome {
        let cmd = CommandSpec::from_vec(&template.render(artifact.file_name()))
            .with_work_dir(artifact.work_dir());
        self.runner.run(&cmd, limits, stdin).await
    }
}

fn trace_state(state: SessionState, language: &str) {
    debug!("Sandbox state -> {} ({})", state, language);
}
