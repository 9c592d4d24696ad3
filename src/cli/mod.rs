//! Command-line interface for swe-trials.
//!
//! Provides commands to run a benchmark, re-evaluate a finished trial and
//! inspect ledger progress.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
