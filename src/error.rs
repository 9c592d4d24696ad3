//! Error types for swe-trials operations.
//!
//! Defines error types for the subsystems a benchmark run touches:
//! - Sandbox provisioning and command execution
//! - Trial steps that abort a trial
//! - Test-output validation
//! - Ledger persistence
//! - Dataset and configuration loading

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a sandbox backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {0}")]
    Provision(String),

    #[error("Command execution failed: {0}")]
    Exec(String),

    #[error("Failed to stage file '{path}': {reason}")]
    Staging { path: String, reason: String },

    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),
}

/// Errors that abort a trial before its outcome can be classified.
///
/// Every variant ends up as `run_failed = true` on the trial result; the
/// display string becomes the result's `error` field.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("Patch failed: {0}")]
    PatchFailed(String),

    #[error("{step} failed: {output}")]
    StepFailed { step: String, output: String },

    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("Agent binary not found at {}", .0.display())]
    AgentBinaryNotFound(PathBuf),

    #[error("Trial panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrialError {
    /// Builds a [`TrialError::StepFailed`] from a step label and captured output.
    pub fn step(step: impl Into<String>, output: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            output: output.into(),
        }
    }
}

/// The evaluation ran but its classification cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Test output is empty")]
    EmptyOutput,

    #[error("Instance declares no fail-to-pass or pass-to-pass tests")]
    NoExpectedTests,

    #[error("Tests missing from test output: {}", .0.join(", "))]
    MissingTests(Vec<String>),
}

/// Errors that can occur while maintaining the results ledger.
#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("Failed to create results directory '{}': {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to persist result to '{}': {source}", path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading a dataset file.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset file '{}' not found", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid dataset row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("Instance '{0}' not found in dataset")]
    UnknownInstance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
