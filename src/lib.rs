//! swe-trials: run coding agents against SWE-bench instances.
//!
//! Each [`trial::Trial`] gives one agent one attempt at one
//! [`instance::Instance`] inside an isolated [`sandbox::Sandbox`], then
//! grades the resulting diff with the instance's tests. A
//! [`benchmark::Benchmark`] sequences trials over a dataset and persists
//! every result, so an interrupted run resumes where it stopped.

pub mod benchmark;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod instance;
pub mod sandbox;
pub mod trial;

// Re-export commonly used types
pub use benchmark::{Benchmark, BenchmarkSummary, PendingRun};
pub use config::BenchConfig;
pub use error::{
    BenchmarkError, ConfigError, DatasetError, SandboxError, TrialError, ValidationError,
};
pub use instance::Instance;
pub use sandbox::{ExecResult, Sandbox, SandboxProvider};
pub use trial::{Prediction, Trial, TrialResult};
