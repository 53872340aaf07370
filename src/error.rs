//! Error types shared by the execution core

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the language table
#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("failed to read language table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse language table: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration for language {language}: {reason}")]
    Invalid { language: String, reason: String },
}

/// Errors raised by the sandbox before or around process execution.
///
/// Program failures (non-zero exit, timeout, memory breach) are not errors;
/// they are reported through `ProcessOutcome`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to prepare scratch directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write source artifact {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}
