//! One agent attempt at one instance, end to end.
//!
//! A trial provisions a sandbox, prepares the repository, lets the agent
//! work under a time budget, captures its diff, runs the tests and
//! classifies the outcome. Steps run strictly in order and the sandbox is
//! torn down on every exit path, panics included.
//!
//! Every artifact lands in the trial's results directory:
//!
//! - `agent_result.txt` (agent output, or the timeout marker)
//! - `prediction.json`
//! - `<run>-pre_patch_test_results.txt` (optional)
//! - `<run>-test_results.txt`
//! - `report.json`

pub mod evaluation;
pub mod result;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::error::{SandboxError, TrialError};
use crate::instance::Instance;
use crate::sandbox::{shell_quote, ExecResult, Sandbox, SandboxProvider};

pub use evaluation::{EvaluationReport, LogParser, TestSetReport, TestStatus};
pub use result::{Prediction, TrialResult};

/// Container path the test patch is staged at.
pub const TEST_PATCH_PATH: &str = "/tmp/test.patch";

/// Container path of the prompt handed to the agent.
pub const PROMPT_PATH: &str = "/tmp/agent/problem_statement.md";

pub const AGENT_RESULT_FILE: &str = "agent_result.txt";
pub const PREDICTION_FILE: &str = "prediction.json";
pub const REPORT_FILE: &str = "report.json";

/// Written to [`AGENT_RESULT_FILE`] when the agent exceeds its budget.
pub const TIMEOUT_MARKER: &str = "Error: Command timed out";

/// Suffix of the post-agent test output file.
pub const TEST_RESULTS_SUFFIX: &str = "-test_results.txt";

/// Suffix of the optional pre-agent test output file.
pub const PRE_PATCH_TEST_RESULTS_SUFFIX: &str = "-pre_patch_test_results.txt";

const BASELINE_MESSAGE: &str = "Baseline before agent run";

/// A single run of one instance.
pub struct Trial {
    instance: Instance,
    name: String,
    results_dir: PathBuf,
    config: BenchConfig,
}

impl Trial {
    /// Creates a trial. `name` is the run name (`<instance_id>-<run>`),
    /// `results_dir` the directory its artifacts are written to.
    pub fn new(
        instance: Instance,
        name: impl Into<String>,
        results_dir: impl Into<PathBuf>,
        config: &BenchConfig,
    ) -> Self {
        Self {
            instance,
            name: name.into(),
            results_dir: results_dir.into(),
            config: config.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Runs the trial to completion. Never fails: every problem is encoded
    /// in the returned result.
    pub async fn run(&self, provider: &dyn SandboxProvider) -> TrialResult {
        info!(
            instance_id = %self.instance.instance_id,
            run_name = %self.name,
            "Starting trial"
        );

        if let Err(e) = std::fs::create_dir_all(&self.results_dir) {
            return self.run_failure(TrialError::Io(e), String::new());
        }

        let sandbox = match provider
            .create_and_start(&self.instance, &self.name, &self.results_dir)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => return self.run_failure(TrialError::Sandbox(e), String::new()),
        };

        let outcome = AssertUnwindSafe(self.execute(sandbox.as_ref()))
            .catch_unwind()
            .await;

        sandbox.teardown().await;

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                self.run_failure(TrialError::Panicked(panic_message(&*payload)), String::new())
            }
        };

        info!(
            instance_id = %self.instance.instance_id,
            run_name = %self.name,
            success = result.success,
            failed = result.failed(),
            "Trial finished"
        );
        result
    }

    /// Classifies persisted artifacts without a sandbox.
    pub fn evaluate_results(
        &self,
        prediction: &Prediction,
        test_output_path: &Path,
    ) -> Result<TrialResult, TrialError> {
        let output = std::fs::read_to_string(test_output_path)?;
        self.classify(&output, prediction.model_patch.clone())
    }

    async fn execute(&self, sandbox: &dyn Sandbox) -> TrialResult {
        let mut patch = String::new();
        match self.steps(sandbox, &mut patch).await {
            Ok(result) => result,
            Err(e) => self.run_failure(e, patch),
        }
    }

    async fn steps(
        &self,
        sandbox: &dyn Sandbox,
        patch: &mut String,
    ) -> Result<TrialResult, TrialError> {
        self.apply_test_patch(sandbox).await?;
        let reference = self.establish_baseline(sandbox).await?;

        if self.config.evaluation.run_pre_patch_tests {
            let output = self.run_test_command(sandbox).await?;
            let file_name = format!("{}{}", self.name, PRE_PATCH_TEST_RESULTS_SUFFIX);
            self.write_artifact(&file_name, &output)?;
        }

        self.install_agent(sandbox).await?;
        self.invoke_agent(sandbox).await?;

        *patch = self.extract_diff(sandbox, &reference).await?;
        let prediction = Prediction::new(
            &self.instance.instance_id,
            &self.config.name,
            patch.as_str(),
        );
        self.write_artifact(PREDICTION_FILE, &serde_json::to_string_pretty(&prediction)?)?;

        let output = self.run_tests(sandbox, &reference).await?;
        self.classify(&output, patch.clone())
    }

    async fn apply_test_patch(&self, sandbox: &dyn Sandbox) -> Result<(), TrialError> {
        if self.instance.test_patch.trim().is_empty() {
            debug!(instance_id = %self.instance.instance_id, "No test patch, skipping");
            return Ok(());
        }

        self.log_step("apply test patch");
        sandbox
            .write_file(&self.instance.test_patch, TEST_PATCH_PATH)
            .await?;
        let result = sandbox
            .exec(&format!("git apply -v {TEST_PATCH_PATH}"), &[])
            .await?;
        if !result.success() {
            return Err(TrialError::PatchFailed(result.output));
        }
        Ok(())
    }

    /// Commits the prepared tree and returns the commit hash.
    async fn establish_baseline(&self, sandbox: &dyn Sandbox) -> Result<String, TrialError> {
        self.log_step("establish baseline");
        let agent = &self.config.agent;
        let commands = [
            format!("git config user.name {}", shell_quote(&agent.git_user_name)),
            format!("git config user.email {}", shell_quote(&agent.git_user_email)),
            "git add .".to_string(),
            format!("git commit --allow-empty -m {}", shell_quote(BASELINE_MESSAGE)),
            "git rev-parse HEAD".to_string(),
        ];

        let mut last = ExecResult::default();
        for command in &commands {
            last = self.checked(sandbox, "baseline", command).await?;
        }

        let reference = last.output.trim().to_string();
        if reference.is_empty() {
            return Err(TrialError::step("baseline", "git rev-parse HEAD printed nothing"));
        }
        debug!(run_name = %self.name, reference = %reference, "Baseline established");
        Ok(reference)
    }

    async fn install_agent(&self, sandbox: &dyn Sandbox) -> Result<(), TrialError> {
        let agent = &self.config.agent;

        if let Some(binary) = &agent.binary {
            self.log_step("install agent binary");
            let file_name = binary
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TrialError::AgentBinaryNotFound(binary.clone()))?;
            let content = tokio::fs::read(binary)
                .await
                .map_err(|_| TrialError::AgentBinaryNotFound(binary.clone()))?;
            let target = format!("/usr/local/bin/{file_name}");
            sandbox.write_bytes(&content, &target).await?;
            self.checked(sandbox, "install agent", &format!("chmod +x {}", shell_quote(&target)))
                .await?;
        }

        for file in &agent.config_files {
            let content = tokio::fs::read(&file.source).await?;
            sandbox.write_bytes(&content, &file.target).await?;
        }

        for command in &agent.install_commands {
            self.checked(sandbox, "install agent", command).await?;
        }
        Ok(())
    }

    async fn invoke_agent(&self, sandbox: &dyn Sandbox) -> Result<(), TrialError> {
        let agent = &self.config.agent;

        let env = agent
            .credential_env
            .iter()
            .map(|key| {
                std::env::var(key)
                    .map(|value| (key.clone(), value))
                    .map_err(|_| TrialError::MissingCredential(key.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        sandbox
            .write_file(&self.instance.problem_statement, PROMPT_PATH)
            .await?;

        let command = agent.render_command(
            PROMPT_PATH,
            &self.instance.instance_id,
            &self.config.sandbox.workdir,
        );

        self.log_step("invoke agent");
        match tokio::time::timeout(agent.timeout(), sandbox.exec(&command, &env)).await {
            Err(_) | Ok(Err(SandboxError::Timeout { .. })) => {
                warn!(
                    instance_id = %self.instance.instance_id,
                    timeout_secs = agent.timeout_secs,
                    "Agent timed out"
                );
                self.write_artifact(AGENT_RESULT_FILE, TIMEOUT_MARKER)?;
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(result)) => {
                if !result.success() {
                    warn!(
                        instance_id = %self.instance.instance_id,
                        exit_code = result.exit_code,
                        output = %truncate(&result.output, 500),
                        "Agent exited with non-zero status"
                    );
                }
                self.write_artifact(AGENT_RESULT_FILE, &result.output)?;
            }
        }
        Ok(())
    }

    async fn extract_diff(
        &self,
        sandbox: &dyn Sandbox,
        reference: &str,
    ) -> Result<String, TrialError> {
        self.log_step("extract diff");
        self.checked(sandbox, "extract diff", "git add -A").await?;

        let mut command = format!("git diff --cached {}", shell_quote(reference));
        if !self.config.evaluation.diff_excludes.is_empty() {
            command.push_str(" -- .");
            for exclude in &self.config.evaluation.diff_excludes {
                command.push(' ');
                command.push_str(&shell_quote(&format!(":(exclude){exclude}")));
            }
        }
        Ok(self.checked(sandbox, "extract diff", &command).await?.output)
    }

    /// Restores the test files to the baseline and runs the tests.
    async fn run_tests(
        &self,
        sandbox: &dyn Sandbox,
        reference: &str,
    ) -> Result<String, TrialError> {
        let files = self.instance.test_files();
        if !files.is_empty() {
            self.log_step("restore test files");
            let quoted: Vec<String> = files.iter().map(|f| shell_quote(f)).collect();
            let command = format!(
                "git checkout {} -- {}",
                shell_quote(reference),
                quoted.join(" ")
            );
            self.checked(sandbox, "restore test files", &command).await?;
        }

        let output = self.run_test_command(sandbox).await?;
        self.write_artifact(&format!("{}{}", self.name, TEST_RESULTS_SUFFIX), &output)?;
        Ok(output)
    }

    /// Runs the test command; a failing exit status is a normal outcome.
    async fn run_test_command(&self, sandbox: &dyn Sandbox) -> Result<String, TrialError> {
        self.log_step("run tests");
        let settings = &self.config.evaluation;
        let command = evaluation::test_command(&self.instance, settings);

        let result = tokio::time::timeout(settings.test_timeout(), sandbox.exec(&command, &[]))
            .await
            .map_err(|_| SandboxError::Timeout {
                seconds: settings.test_timeout().as_secs(),
            })??;
        debug!(
            instance_id = %self.instance.instance_id,
            exit_code = result.exit_code,
            "Tests finished"
        );
        Ok(result.output)
    }

    fn classify(&self, output: &str, patch: String) -> Result<TrialResult, TrialError> {
        let report = EvaluationReport::from_output(&self.instance, output);
        self.write_artifact(REPORT_FILE, &serde_json::to_string_pretty(&report)?)?;

        Ok(match report.verdict() {
            Ok(success) => TrialResult::evaluated(self.instance.clone(), success, patch),
            Err(e) => {
                warn!(
                    instance_id = %self.instance.instance_id,
                    error = %e,
                    "Test output failed validation"
                );
                TrialResult::validation_failure(self.instance.clone(), e.to_string(), patch)
            }
        })
    }

    /// Runs a command whose non-zero exit aborts the trial.
    async fn checked(
        &self,
        sandbox: &dyn Sandbox,
        step: &str,
        command: &str,
    ) -> Result<ExecResult, TrialError> {
        let result = sandbox.exec(command, &[]).await?;
        if !result.success() {
            return Err(TrialError::step(
                format!("{step} ({command})"),
                truncate(result.output.trim_end(), 2000),
            ));
        }
        Ok(result)
    }

    fn write_artifact(&self, file_name: &str, content: &str) -> Result<PathBuf, TrialError> {
        let path = self.results_dir.join(file_name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    fn run_failure(&self, error: TrialError, patch: String) -> TrialResult {
        warn!(
            instance_id = %self.instance.instance_id,
            run_name = %self.name,
            error = %error,
            "Trial failed"
        );
        TrialResult::run_failure(self.instance.clone(), error.to_string(), patch)
    }

    fn log_step(&self, step: &str) {
        info!(
            instance_id = %self.instance.instance_id,
            run_name = %self.name,
            step = step,
            "Trial step"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
