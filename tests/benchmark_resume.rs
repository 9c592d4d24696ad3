//! End-to-end ledger behaviour with an in-memory sandbox.
//!
//! Runs part of a benchmark, drops it as if the process died, reopens it
//! over the same results directory and checks that it resumes.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use swe_trials::benchmark::output::{PREDICTIONS_FILE, RESULTS_FILE};
use swe_trials::dataset;
use swe_trials::{
    BenchConfig, Benchmark, ExecResult, Instance, Prediction, Sandbox, SandboxError,
    SandboxProvider, TrialResult,
};
use tempfile::TempDir;

const DATASET: &str = r#"{"instance_id": "acme__api-2", "repo": "acme/api", "version": "1.0", "problem_statement": "Fix b", "FAIL_TO_PASS": "[\"tests/test_api.py::test_b\"]", "PASS_TO_PASS": "[]", "test_patch": "diff --git a/tests/test_api.py b/tests/test_api.py\n"}
{"instance_id": "acme__api-1", "repo": "acme/api", "version": "1.0", "problem_statement": "Fix a", "FAIL_TO_PASS": ["tests/test_api.py::test_a"], "PASS_TO_PASS": [], "test_patch": "diff --git a/tests/test_api.py b/tests/test_api.py\n"}
{"instance_id": "acme__api-3", "repo": "acme/api", "version": "1.0", "problem_statement": "Fix c", "FAIL_TO_PASS": ["tests/test_api.py::test_c"], "PASS_TO_PASS": []}
{"instance_id": "other__lib-1", "repo": "other/lib", "version": "0.1", "problem_statement": "Broken", "FAIL_TO_PASS": ["tests/test_lib.py::test_x"], "PASS_TO_PASS": []}
"#;

/// Pretends every agent fixes its bug, except in `other/lib` where the
/// image cannot be provisioned.
struct FakeProvider {
    provisioned: AtomicUsize,
    torn_down: Arc<AtomicUsize>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            provisioned: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct FakeSandbox {
    instance: Instance,
    torn_down: Arc<AtomicUsize>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn name(&self) -> &str {
        &self.instance.instance_id
    }

    async fn exec(
        &self,
        command: &str,
        _env: &[(String, String)],
    ) -> Result<ExecResult, SandboxError> {
        if command == "git rev-parse HEAD" {
            return Ok(ExecResult::new("0123abcd\n", 0));
        }
        if command.starts_with("git diff --cached") {
            return Ok(ExecResult::new(
                format!("diff --git a/src/api.py b/src/api.py\n+# {}\n", self.instance.instance_id),
                0,
            ));
        }
        if command.contains("pytest") {
            let log: String = self
                .instance
                .fail_to_pass
                .iter()
                .map(|t| format!("PASSED {t}\n"))
                .collect();
            return Ok(ExecResult::new(log, 0));
        }
        Ok(ExecResult::default())
    }

    async fn write_bytes(&self, _content: &[u8], path: &str) -> Result<(), SandboxError> {
        assert!(path.starts_with('/'), "relative path {path}");
        Ok(())
    }

    async fn teardown(&self) {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create_and_start(
        &self,
        instance: &Instance,
        _run_id: &str,
        run_dir: &Path,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        assert!(run_dir.is_dir());
        if instance.repo == "other/lib" {
            return Err(SandboxError::Provision("manifest unknown".to_string()));
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSandbox {
            instance: instance.clone(),
            torn_down: Arc::clone(&self.torn_down),
        }))
    }
}

fn config(results_root: &Path) -> BenchConfig {
    let mut config = BenchConfig::new()
        .with_name("nightly")
        .with_results_dir(results_root);
    config.agent.command = "fake-agent {prompt_file}".to_string();
    config.agent.credential_env = Vec::new();
    config.dataset.per_repo_limit = 2;
    config
}

fn selected(temp: &TempDir, config: &BenchConfig) -> Vec<Instance> {
    let path = temp.path().join("dataset.jsonl");
    std::fs::write(&path, DATASET).unwrap();
    let instances = dataset::load_instances(&path).unwrap();
    dataset::select_instances(instances, None, config.dataset.per_repo_limit).unwrap()
}

#[tokio::test]
async fn test_interrupted_benchmark_resumes() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("results");
    let config = config(&root);
    let instances = selected(&temp, &config);
    let ids: Vec<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["acme__api-1", "acme__api-2", "other__lib-1"]);

    let provider = FakeProvider::new();

    {
        let mut benchmark = Benchmark::new(&config.name, instances.clone(), &root).unwrap();
        let first = benchmark
            .run_next_trial(&provider, &config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.instance.instance_id, "acme__api-1");
        assert!(first.success, "{first:?}");
    }

    let mut benchmark = Benchmark::new(&config.name, instances, &root).unwrap();
    assert_eq!(benchmark.results().len(), 1);
    assert_eq!(benchmark.next_run().unwrap().run_name, "acme__api-2-1");

    while benchmark
        .run_next_trial(&provider, &config)
        .await
        .unwrap()
        .is_some()
    {}

    assert_eq!(provider.provisioned.load(Ordering::SeqCst), 2);
    assert_eq!(provider.torn_down.load(Ordering::SeqCst), 2);

    let failed = &benchmark.results()["other__lib-1-1"];
    assert!(failed.run_failed);
    assert!(failed.error.as_deref().unwrap().contains("manifest unknown"));

    let summary = benchmark.summary();
    assert_eq!(summary.resolved, 2);
    assert_eq!(summary.run_failed, 1);
    assert_eq!(summary.pending, 0);

    let predictions_path = root.join(PREDICTIONS_FILE);
    assert_eq!(benchmark.write_predictions(&predictions_path).unwrap(), 2);
    let predictions: Vec<Prediction> = std::fs::read_to_string(&predictions_path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(predictions[1].instance_id, "acme__api-2");
    assert_eq!(predictions[1].model_name_or_path, "nightly");
    assert!(predictions[1].model_patch.contains("+# acme__api-2"));

    let results_path = root.join(RESULTS_FILE);
    benchmark.write_results(&results_path).unwrap();
    let all: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(results_path).unwrap()).unwrap();
    assert_eq!(all.as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_trial_artifacts_layout() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("results");
    let config = config(&root);
    let instances = selected(&temp, &config);

    let mut benchmark = Benchmark::new(&config.name, instances, &root).unwrap();
    benchmark
        .run_next_trial(&FakeProvider::new(), &config)
        .await
        .unwrap();

    let trial_dir = root.join("nightly/acme__api-1/1");
    for file in [
        "result.json",
        "agent_result.txt",
        "prediction.json",
        "report.json",
        "acme__api-1-1-test_results.txt",
    ] {
        assert!(trial_dir.join(file).is_file(), "missing {file}");
    }

    let persisted =
        TrialResult::from_json(&std::fs::read_to_string(trial_dir.join("result.json")).unwrap())
            .unwrap();
    assert_eq!(persisted.instance.problem_statement, "Fix a");
}
