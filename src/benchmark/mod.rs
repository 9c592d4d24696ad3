//! Resumable benchmark ledger.
//!
//! The results directory is the database: every finished trial leaves
//! `<results_root>/<name>/<instance_id>/<run>/result.json`, and a new
//! [`Benchmark`] rebuilds its ledger from those files. Running the same
//! benchmark again picks up where the previous process stopped.
//!
//! The ledger assumes a single writer. Two processes sharing a results
//! directory will run the same instances twice.

pub mod output;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::BenchConfig;
use crate::error::BenchmarkError;
use crate::instance::Instance;
use crate::sandbox::SandboxProvider;
use crate::trial::{Trial, TrialResult};

pub use output::BenchmarkSummary;

/// File holding a persisted trial result.
pub const RESULT_FILE: &str = "result.json";

/// Every instance runs exactly once.
pub const FIRST_RUN: u32 = 1;

/// The next trial the ledger is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRun {
    pub instance: Instance,
    pub run: u32,
    /// `<instance_id>-<run>`.
    pub run_name: String,
}

/// An ordered set of instances and the results recorded for them.
#[derive(Debug)]
pub struct Benchmark {
    name: String,
    instances: Vec<Instance>,
    results_dir: PathBuf,
    results: BTreeMap<String, TrialResult>,
}

impl Benchmark {
    /// Opens (or creates) `<results_root>/<name>` and loads every persisted
    /// result found there.
    pub fn new(
        name: impl Into<String>,
        instances: Vec<Instance>,
        results_root: impl AsRef<Path>,
    ) -> Result<Self, BenchmarkError> {
        let name = name.into();
        let results_dir = results_root.as_ref().join(&name);
        std::fs::create_dir_all(&results_dir).map_err(|source| BenchmarkError::CreateDir {
            path: results_dir.clone(),
            source,
        })?;
        // Run directories become bind mount sources, which must be absolute.
        let results_dir = results_dir
            .canonicalize()
            .map_err(|source| BenchmarkError::CreateDir {
                path: results_dir.clone(),
                source,
            })?;

        let results = load_results(&results_dir);
        info!(
            benchmark = %name,
            instances = instances.len(),
            completed = results.len(),
            results_dir = %results_dir.display(),
            "Loaded benchmark ledger"
        );

        Ok(Self {
            name,
            instances,
            results_dir,
            results,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// `<results_root>/<name>`.
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Recorded results keyed by run name.
    pub fn results(&self) -> &BTreeMap<String, TrialResult> {
        &self.results
    }

    /// Directory holding one trial's artifacts.
    pub fn run_dir(&self, instance_id: &str, run: u32) -> PathBuf {
        self.results_dir.join(instance_id).join(run.to_string())
    }

    /// First instance, in input order, without a recorded first run.
    pub fn next_run(&self) -> Option<PendingRun> {
        self.instances.iter().find_map(|instance| {
            let run_name = run_name(&instance.instance_id, FIRST_RUN);
            if self.results.contains_key(&run_name) {
                None
            } else {
                Some(PendingRun {
                    instance: instance.clone(),
                    run: FIRST_RUN,
                    run_name,
                })
            }
        })
    }

    /// Runs the next pending trial and persists its result.
    ///
    /// Returns `Ok(None)` once every instance has a result. Trial problems
    /// are part of the returned result; only failures to persist it are
    /// errors.
    pub async fn run_next_trial(
        &mut self,
        provider: &dyn SandboxProvider,
        config: &BenchConfig,
    ) -> Result<Option<TrialResult>, BenchmarkError> {
        let Some(pending) = self.next_run() else {
            debug!(benchmark = %self.name, "No pending runs");
            return Ok(None);
        };

        let run_dir = self.run_dir(&pending.instance.instance_id, pending.run);
        std::fs::create_dir_all(&run_dir).map_err(|source| BenchmarkError::CreateDir {
            path: run_dir.clone(),
            source,
        })?;

        let trial = Trial::new(pending.instance, &pending.run_name, &run_dir, config);
        let result = trial.run(provider).await;

        persist(&run_dir.join(RESULT_FILE), &result)?;
        self.results.insert(pending.run_name.clone(), result.clone());

        info!(
            run_name = %pending.run_name,
            success = result.success,
            failed = result.failed(),
            "Recorded trial result"
        );
        Ok(Some(result))
    }
}

/// `<instance_id>-<run>`.
pub fn run_name(instance_id: &str, run: u32) -> String {
    format!("{instance_id}-{run}")
}

/// Reads `*/<run>/result.json` exactly three levels below `dir`.
fn load_results(dir: &Path) -> BTreeMap<String, TrialResult> {
    let mut results = BTreeMap::new();

    let entries = WalkDir::new(dir)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable ledger entry");
                None
            }
        });

    for entry in entries {
        if !entry.file_type().is_file() || entry.file_name() != RESULT_FILE {
            continue;
        }
        let path = entry.path();
        let Some((instance_id, run)) = ledger_key(dir, path) else {
            continue;
        };

        let loaded = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|json| TrialResult::from_json(&json).map_err(|e| e.to_string()));
        match loaded {
            Ok(result) => {
                results.insert(run_name(&instance_id, run), result);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed result file");
            }
        }
    }
    results
}

fn ledger_key(root: &Path, path: &Path) -> Option<(String, u32)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.iter().map(|p| p.to_str());
    let instance_id = parts.next()??;
    let run = parts.next()??.parse().ok()?;
    Some((instance_id.to_string(), run))
}

/// Writes and flushes a result before returning.
fn persist(path: &Path, result: &TrialResult) -> Result<(), BenchmarkError> {
    let json = result.to_json()?;
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()
    };
    write().map_err(|source| BenchmarkError::Persist {
        path: path.to_path_buf(),
        source,
    })
}
