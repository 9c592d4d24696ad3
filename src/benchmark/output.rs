//! Submission and report files derived from the ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::benchmark::Benchmark;
use crate::error::BenchmarkError;
use crate::trial::{Prediction, TrialResult};

/// Submission file name.
pub const PREDICTIONS_FILE: &str = "predictions.jsonl";

/// Aggregate results file name.
pub const RESULTS_FILE: &str = "swe_bench_results.json";

/// Counts over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub total: usize,
    pub completed: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub run_failed: usize,
    pub validation_failed: usize,
    pub pending: usize,
}

impl BenchmarkSummary {
    /// Resolved share of completed trials, in percent.
    pub fn resolve_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.resolved as f64 * 100.0 / self.completed as f64
        }
    }
}

impl fmt::Display for BenchmarkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} completed, {} resolved ({:.1}%), {} unresolved, {} run failures, {} validation failures, {} pending",
            self.completed,
            self.total,
            self.resolved,
            self.resolve_rate(),
            self.unresolved,
            self.run_failed,
            self.validation_failed,
            self.pending
        )
    }
}

impl Benchmark {
    /// One prediction per result that did not fail, in run-name order.
    pub fn predictions(&self) -> Vec<Prediction> {
        self.results()
            .iter()
            .filter(|(_, result)| !result.failed())
            .map(|(run_name, result)| {
                Prediction::new(&result.instance.instance_id, self.name(), &result.patch)
                    .with_run_name(run_name)
            })
            .collect()
    }

    /// Writes [`Self::predictions`] as JSON lines.
    pub fn write_predictions(&self, path: &Path) -> Result<usize, BenchmarkError> {
        let predictions = self.predictions();
        let mut content = String::new();
        for prediction in &predictions {
            content.push_str(&serde_json::to_string(prediction)?);
            content.push('\n');
        }
        write_file(path, &content)?;
        Ok(predictions.len())
    }

    /// Writes every result keyed by run name, keys sorted.
    pub fn write_results(&self, path: &Path) -> Result<(), BenchmarkError> {
        let results: &BTreeMap<String, TrialResult> = self.results();
        write_file(path, &serde_json::to_string_pretty(results)?)
    }

    pub fn summary(&self) -> BenchmarkSummary {
        let mut summary = BenchmarkSummary {
            total: self.instances().len(),
            ..Default::default()
        };

        for instance in self.instances() {
            let run_name = super::run_name(&instance.instance_id, super::FIRST_RUN);
            let Some(result) = self.results().get(&run_name) else {
                summary.pending += 1;
                continue;
            };
            summary.completed += 1;
            if result.run_failed {
                summary.run_failed += 1;
            } else if result.validation_failed {
                summary.validation_failed += 1;
            } else if result.resolved() {
                summary.resolved += 1;
            } else {
                summary.unresolved += 1;
            }
        }
        summary
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), BenchmarkError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    };
    write().map_err(|source| BenchmarkError::Persist {
        path: path.to_path_buf(),
        source,
    })
}
