//! Code Runner - sandboxed multi-language execution
//!
//! `CodeRunner::execute(code, language, stdin)` materializes the source into an
//! execution-scoped directory, compiles it when the language needs it, runs it
//! under a timeout, memory ceiling and output cap, and always removes the
//! directory before returning.

pub mod config;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod languages;
pub mod materializer;
pub mod memory;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;

pub use config::RunnerConfig;
pub use error::{LanguageError, SandboxError};
pub use languages::{LanguageRegistry, LanguageSpec};
pub use runner::{CodeRunner, ExecutionOutcome, ExecutionRequest, ExecutionStatus};
