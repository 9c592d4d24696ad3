//! CLI command definitions for swe-trials.
//!
//! `run` drives the benchmark loop to completion, `evaluate` re-classifies
//! a finished trial from its persisted files, and `status` prints the
//! ledger without running anything.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::benchmark::output::{PREDICTIONS_FILE, RESULTS_FILE};
use crate::benchmark::Benchmark;
use crate::config::BenchConfig;
use crate::dataset;
use crate::instance::Instance;
use crate::sandbox::DockerSandboxProvider;
use crate::trial::{
    Prediction, Trial, PREDICTION_FILE, PRE_PATCH_TEST_RESULTS_SUFFIX, TEST_RESULTS_SUFFIX,
};

/// Runs coding agents against SWE-bench instances in isolated sandboxes.
#[derive(Parser)]
#[command(name = "swe-trials")]
#[command(about = "Run coding agents against SWE-bench instances in isolated sandboxes")]
#[command(version)]
#[command(
    long_about = "swe-trials runs an agent once per SWE-bench instance inside the instance's evaluation image, captures its diff, runs the tests and records the outcome.\n\nResults are persisted per trial, so an interrupted run resumes where it stopped.\n\nExample usage:\n  swe-trials run --dataset swe-bench-lite.jsonl --per-repo 2 --results-dir ./results"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every pending trial and write the submission files.
    Run(RunArgs),

    /// Re-classify a finished trial from its persisted artifacts.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Show ledger progress without running anything.
    Status(StatusArgs),
}

/// Options shared by commands that open a benchmark.
#[derive(Parser, Debug, Clone)]
pub struct SelectionArgs {
    /// Dataset file (JSON array or JSON lines of SWE-bench rows).
    #[arg(short, long, env = "SWE_TRIALS_DATASET")]
    pub dataset: PathBuf,

    /// YAML configuration file.
    #[arg(short, long, env = "SWE_TRIALS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run a single instance.
    #[arg(short, long)]
    pub instance: Option<String>,

    /// Instances per repository after sorting by id (0 = all).
    #[arg(long)]
    pub per_repo: Option<usize>,

    /// Benchmark name (results subdirectory and submission model name).
    #[arg(long)]
    pub name: Option<String>,

    /// Root directory for results.
    #[arg(short = 'o', long)]
    pub results_dir: Option<PathBuf>,
}

/// Arguments for `swe-trials run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Agent time budget in seconds.
    #[arg(long)]
    pub agent_timeout: Option<u64>,

    /// Pull every selected image before the first trial.
    #[arg(long)]
    pub pull_images: bool,

    /// Print the final summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `swe-trials evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Dataset file containing the instance.
    #[arg(short, long, env = "SWE_TRIALS_DATASET")]
    pub dataset: PathBuf,

    /// Instance to evaluate.
    #[arg(short, long)]
    pub instance: String,

    /// Trial directory holding `prediction.json` and the test output.
    #[arg(short, long)]
    pub results_path: PathBuf,

    /// YAML configuration file.
    #[arg(short, long, env = "SWE_TRIALS_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Arguments for `swe-trials status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Print the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Evaluate(args) => evaluate_command(args),
        Commands::Status(args) => status_command(args),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BenchConfig> {
    match path {
        Some(path) => BenchConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(BenchConfig::new()),
    }
}

/// File values first, then flags.
fn resolve_config(selection: &SelectionArgs) -> anyhow::Result<BenchConfig> {
    let mut config = load_config(selection.config.as_deref())?;
    if let Some(name) = &selection.name {
        config = config.with_name(name);
    }
    if let Some(dir) = &selection.results_dir {
        config = config.with_results_dir(dir);
    }
    if let Some(limit) = selection.per_repo {
        config.dataset.per_repo_limit = limit;
    }
    config.validate()?;
    Ok(config)
}

fn open_benchmark(selection: &SelectionArgs, config: &BenchConfig) -> anyhow::Result<Benchmark> {
    let instances = dataset::load_instances(&selection.dataset)?;
    let selected = dataset::select_instances(
        instances,
        selection.instance.as_deref(),
        config.dataset.per_repo_limit,
    )?;
    Ok(Benchmark::new(&config.name, selected, &config.results_dir)?)
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = resolve_config(&args.selection)?;
    if let Some(secs) = args.agent_timeout {
        config = config.with_agent_timeout(Duration::from_secs(secs));
    }
    if args.pull_images {
        config.sandbox.pull_missing_images = true;
    }

    let mut benchmark = open_benchmark(&args.selection, &config)?;
    let provider = DockerSandboxProvider::new(config.sandbox.clone())
        .context("connecting to the Docker daemon")?;

    if args.pull_images {
        let images: BTreeSet<&str> = benchmark
            .instances()
            .iter()
            .map(|i| i.instance_image_key.as_str())
            .collect();
        info!(count = images.len(), "Pre-pulling images");
        for image in images {
            provider.ensure_image(image).await?;
        }
    }

    info!(
        benchmark = %config.name,
        pending = benchmark.summary().pending,
        "Starting benchmark"
    );
    while let Some(result) = benchmark.run_next_trial(&provider, &config).await? {
        if let Some(error) = &result.error {
            warn!(instance_id = %result.instance.instance_id, error = %error, "Trial did not complete cleanly");
        }
    }

    let predictions_path = config.results_dir.join(PREDICTIONS_FILE);
    let written = benchmark.write_predictions(&predictions_path)?;
    let results_path = config.results_dir.join(RESULTS_FILE);
    benchmark.write_results(&results_path)?;
    info!(
        predictions = written,
        predictions_path = %predictions_path.display(),
        results_path = %results_path.display(),
        "Wrote benchmark outputs"
    );

    print_summary(&benchmark, args.json)
}

fn evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let instance = find_instance(&args.dataset, &args.instance)?;

    let prediction_path = args.results_path.join(PREDICTION_FILE);
    let prediction: Prediction = serde_json::from_str(
        &std::fs::read_to_string(&prediction_path)
            .with_context(|| format!("reading {}", prediction_path.display()))?,
    )?;

    let test_output = latest_test_output(&args.results_path)?.with_context(|| {
        format!("no test results found in {}", args.results_path.display())
    })?;
    let run_name = test_output
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(TEST_RESULTS_SUFFIX))
        .unwrap_or(args.instance.as_str())
        .to_string();

    let trial = Trial::new(instance, run_name, &args.results_path, &config);
    let result = trial.evaluate_results(&prediction, &test_output)?;

    println!("{}", result.to_json()?);
    Ok(())
}

fn status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args.selection)?;
    let benchmark = open_benchmark(&args.selection, &config)?;
    print_summary(&benchmark, args.json)
}

fn print_summary(benchmark: &Benchmark, json: bool) -> anyhow::Result<()> {
    let summary = benchmark.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("\n=== {} ===", benchmark.name());
    println!("Total instances:    {}", summary.total);
    println!("Completed:          {}", summary.completed);
    println!("Resolved:           {}", summary.resolved);
    println!("Unresolved:         {}", summary.unresolved);
    println!("Run failures:       {}", summary.run_failed);
    println!("Validation failures: {}", summary.validation_failed);
    println!("Pending:            {}", summary.pending);
    println!("Resolve rate:       {:.1}%", summary.resolve_rate());
    println!();

    for (run_name, result) in benchmark.results() {
        let status = if result.run_failed {
            "run_failed"
        } else if result.validation_failed {
            "validation_failed"
        } else if result.resolved() {
            "resolved"
        } else {
            "unresolved"
        };
        println!("  {run_name} [{status}]");
        if let Some(err) = &result.error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

fn find_instance(dataset_path: &Path, instance_id: &str) -> anyhow::Result<Instance> {
    let instances = dataset::load_instances(dataset_path)?;
    let mut selected = dataset::select_instances(instances, Some(instance_id), 0)?;
    selected
        .pop()
        .with_context(|| format!("instance {instance_id} not found"))
}

/// Most recently modified post-agent test output in a trial directory.
fn latest_test_output(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.ends_with(TEST_RESULTS_SUFFIX) || name.ends_with(PRE_PATCH_TEST_RESULTS_SUFFIX) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_options() {
        let cli = Cli::try_parse_from([
            "swe-trials",
            "run",
            "--dataset",
            "lite.jsonl",
            "--instance",
            "psf__requests-1142",
            "--per-repo",
            "3",
            "--name",
            "nightly",
            "--results-dir",
            "/tmp/results",
            "--agent-timeout",
            "600",
            "--pull-images",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.selection.dataset, PathBuf::from("lite.jsonl"));
                assert_eq!(args.selection.instance.as_deref(), Some("psf__requests-1142"));
                assert_eq!(args.selection.per_repo, Some(3));
                assert_eq!(args.agent_timeout, Some(600));
                assert!(args.pull_images);
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_evaluate_requires_instance() {
        let result = Cli::try_parse_from([
            "swe-trials",
            "evaluate",
            "--dataset",
            "lite.jsonl",
            "--results-path",
            "./results/x/1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_config_applies_flags_over_defaults() {
        let selection = SelectionArgs {
            dataset: PathBuf::from("lite.jsonl"),
            config: None,
            instance: None,
            per_repo: Some(0),
            name: Some("nightly".to_string()),
            results_dir: Some(PathBuf::from("/tmp/out")),
        };

        let config = resolve_config(&selection).unwrap();
        assert_eq!(config.name, "nightly");
        assert_eq!(config.results_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.dataset.per_repo_limit, 0);
    }

    #[test]
    fn test_resolve_config_rejects_bad_name() {
        let selection = SelectionArgs {
            dataset: PathBuf::from("lite.jsonl"),
            config: None,
            instance: None,
            per_repo: None,
            name: Some("a/b".to_string()),
            results_dir: None,
        };
        assert!(resolve_config(&selection).is_err());
    }

    #[test]
    fn test_latest_test_output_skips_pre_patch() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("x-1-pre_patch_test_results.txt"), "pre").unwrap();
        std::fs::write(temp.path().join("x-1-test_results.txt"), "post").unwrap();
        std::fs::write(temp.path().join("agent_result.txt"), "agent").unwrap();

        let found = latest_test_output(temp.path()).unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "x-1-test_results.txt");
    }

    #[test]
    fn test_latest_test_output_none() {
        let temp = TempDir::new().unwrap();
        assert!(latest_test_output(temp.path()).unwrap().is_none());
    }
}
