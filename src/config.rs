//! Configuration for benchmark runs.
//!
//! Everything has a default, so a run works without a config file. A YAML
//! file can override any subset of fields; CLI flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default benchmark name, used as the results subdirectory and as
/// `model_name_or_path` in submissions.
pub const DEFAULT_BENCHMARK_NAME: &str = "swe-bench-agent";

/// Top-level configuration for a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Benchmark run name.
    pub name: String,
    /// Root directory for results.
    pub results_dir: PathBuf,
    /// Sandbox settings.
    pub sandbox: SandboxSettings,
    /// Agent installation and invocation.
    pub agent: AgentSettings,
    /// Test execution and diff capture.
    pub evaluation: EvaluationSettings,
    /// Instance selection.
    pub dataset: DatasetSettings,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BENCHMARK_NAME.to_string(),
            results_dir: PathBuf::from("./results"),
            sandbox: SandboxSettings::default(),
            agent: AgentSettings::default(),
            evaluation: EvaluationSettings::default(),
            dataset: DatasetSettings::default(),
        }
    }
}

impl BenchConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a YAML file; missing fields keep defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        if config.name.is_empty() {
            config.name = DEFAULT_BENCHMARK_NAME.to_string();
        }
        if config.results_dir.as_os_str().is_empty() {
            config.results_dir = PathBuf::from("./results");
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.contains('/') || self.name.contains("..") {
            return Err(ConfigError::Invalid(format!(
                "benchmark name '{}' must be a single path component",
                self.name
            )));
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if !self.sandbox.workdir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "sandbox.workdir '{}' must be absolute",
                self.sandbox.workdir
            )));
        }
        for file in &self.agent.config_files {
            if !file.target.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "agent config file target '{}' must be absolute",
                    file.target
                )));
            }
        }
        Ok(())
    }

    /// Sets the benchmark name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the results root.
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Sets the agent time budget.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent.timeout_secs = timeout.as_secs().max(1);
        self
    }
}

/// Settings for the isolated execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Working directory inside the environment (the task repository).
    pub workdir: String,
    /// Platform requested for the container.
    pub platform: String,
    /// User commands run as.
    pub user: String,
    /// Pull the instance image when it is not present locally.
    pub pull_missing_images: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workdir: "/testbed".to_string(),
            platform: "linux/x86_64".to_string(),
            user: "root".to_string(),
            pull_missing_images: true,
        }
    }
}

/// A file copied from the host into the environment before the agent runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Host path.
    pub source: PathBuf,
    /// Absolute path inside the environment.
    pub target: String,
}

/// How the agent is deployed and invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Host path of an agent binary to install as `/usr/local/bin/<name>`.
    pub binary: Option<PathBuf>,
    /// Command template. Placeholders: `{prompt_file}`, `{instance_id}`, `{workdir}`.
    pub command: String,
    /// Wall-clock budget for one invocation.
    pub timeout_secs: u64,
    /// Host environment variables forwarded to the agent.
    pub credential_env: Vec<String>,
    /// Extra shell commands run inside the environment after installation.
    pub install_commands: Vec<String>,
    /// Files copied into the environment before invocation.
    pub config_files: Vec<ConfigFile>,
    /// Committer identity for the baseline commit.
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: None,
            command: r#"kwaak --allow-dirty run-agent --initial-message "$(cat {prompt_file})""#
                .to_string(),
            timeout_secs: 3600,
            credential_env: vec!["OPENAI_API_KEY".to_string()],
            install_commands: Vec::new(),
            config_files: Vec::new(),
            git_user_name: "swe-trials".to_string(),
            git_user_email: "swe-trials@localhost".to_string(),
        }
    }
}

impl AgentSettings {
    /// The invocation time budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Renders the command template for one invocation.
    pub fn render_command(&self, prompt_file: &str, instance_id: &str, workdir: &str) -> String {
        self.command
            .replace("{prompt_file}", prompt_file)
            .replace("{instance_id}", instance_id)
            .replace("{workdir}", workdir)
    }
}

/// Settings for diff capture and test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Run the test command once before the agent and keep its output.
    pub run_pre_patch_tests: bool,
    /// Pathspecs excluded from the captured diff.
    pub diff_excludes: Vec<String>,
    /// Shell prefix that activates the test environment.
    pub test_preamble: String,
    /// Upper bound for one test run.
    pub test_timeout_secs: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            run_pre_patch_tests: false,
            diff_excludes: vec!["kwaak.toml".to_string()],
            test_preamble: "source /opt/miniconda3/bin/activate && conda activate testbed"
                .to_string(),
            test_timeout_secs: 1800,
        }
    }
}

impl EvaluationSettings {
    /// The test run time budget.
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs.max(1))
    }
}

/// Instance selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// Instances taken per repository after sorting by id; 0 takes all.
    pub per_repo_limit: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self { per_repo_limit: 2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::new();
        assert_eq!(config.name, DEFAULT_BENCHMARK_NAME);
        assert_eq!(config.results_dir, PathBuf::from("./results"));
        assert_eq!(config.sandbox.workdir, "/testbed");
        assert_eq!(config.agent.timeout(), Duration::from_secs(3600));
        assert_eq!(config.dataset.per_repo_limit, 2);
        assert!(!config.evaluation.run_pre_patch_tests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
name: nightly
agent:
  timeout_secs: 120
  credential_env: [ANTHROPIC_API_KEY]
evaluation:
  run_pre_patch_tests: true
"#;
        let config = BenchConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, "nightly");
        assert_eq!(config.agent.timeout_secs, 120);
        assert_eq!(config.agent.credential_env, vec!["ANTHROPIC_API_KEY"]);
        assert_eq!(config.agent.git_user_name, "swe-trials");
        assert!(config.evaluation.run_pre_patch_tests);
        assert_eq!(config.sandbox.platform, "linux/x86_64");
        assert_eq!(config.results_dir, PathBuf::from("./results"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(BenchConfig::from_yaml_str("name: a/b").is_err());
        assert!(BenchConfig::from_yaml_str("agent:\n  timeout_secs: 0").is_err());
        assert!(BenchConfig::from_yaml_str("sandbox:\n  workdir: relative").is_err());
        let yaml = "agent:\n  config_files:\n    - source: ./kwaak.toml\n      target: kwaak.toml\n";
        assert!(BenchConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_builder() {
        let config = BenchConfig::new()
            .with_name("smoke")
            .with_results_dir("/tmp/out")
            .with_agent_timeout(Duration::from_secs(30));
        assert_eq!(config.name, "smoke");
        assert_eq!(config.results_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.agent.timeout_secs, 30);
    }

    #[test]
    fn test_render_command() {
        let agent = AgentSettings {
            command: "agent --prompt {prompt_file} --id {instance_id} -C {workdir}".to_string(),
            ..Default::default()
        };
        assert_eq!(
            agent.render_command("/tmp/p.md", "a__b-1", "/testbed"),
            "agent --prompt /tmp/p.md --id a__b-1 -C /testbed"
        );
    }
}
