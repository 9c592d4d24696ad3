//! Benchmark task instances.
//!
//! An [`Instance`] is one SWE-bench style task: a repository at a version,
//! the golden fix and test-harness patches, and the fail-to-pass /
//! pass-to-pass test partitions used to grade an agent's change.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::LazyLock;

/// Registry namespace that hosts the pre-built evaluation images.
pub const DEFAULT_IMAGE_NAMESPACE: &str = "swebench";

/// Architecture component of evaluation image names.
pub const DEFAULT_IMAGE_ARCH: &str = "x86_64";

/// File extensions that never carry runnable tests.
const NON_TEST_EXTENSIONS: &[&str] = &[
    ".json", ".png", ".csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

static DIFF_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^diff --git a/\S+ b/(\S+)$").expect("diff header regex is valid")
});

/// One benchmark task. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Stable identifier, e.g. `psf__requests-1142`.
    pub instance_id: String,
    /// Source repository in `owner/name` form.
    pub repo: String,
    /// Version tag of the repository environment.
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
    /// Commit the task starts from.
    #[serde(default, deserialize_with = "lenient_string")]
    pub base_commit: String,
    /// Golden fix.
    #[serde(default, deserialize_with = "lenient_string")]
    pub patch: String,
    /// Golden test-harness patch.
    #[serde(default, deserialize_with = "lenient_string")]
    pub test_patch: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub problem_statement: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub hints_text: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub environment_setup_commit: String,
    /// Tests the golden fix flips from failing to passing.
    #[serde(default, alias = "FAIL_TO_PASS", deserialize_with = "test_list")]
    pub fail_to_pass: Vec<String>,
    /// Tests that must keep passing.
    #[serde(default, alias = "PASS_TO_PASS", deserialize_with = "test_list")]
    pub pass_to_pass: Vec<String>,
    /// Pre-built sandbox image for this task.
    #[serde(default, deserialize_with = "lenient_string")]
    pub instance_image_key: String,
    /// Overrides the per-repository test command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
}

impl Instance {
    /// Creates an instance with only identity fields set.
    pub fn new(
        instance_id: impl Into<String>,
        repo: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            instance_image_key: default_image_key(&instance_id, DEFAULT_IMAGE_NAMESPACE),
            instance_id,
            repo: repo.into(),
            version: version.into(),
            base_commit: String::new(),
            patch: String::new(),
            test_patch: String::new(),
            problem_statement: String::new(),
            hints_text: String::new(),
            created_at: String::new(),
            environment_setup_commit: String::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            test_command: None,
        }
    }

    /// Sets the test-harness patch.
    pub fn with_test_patch(mut self, patch: impl Into<String>) -> Self {
        self.test_patch = patch.into();
        self
    }

    /// Sets the problem statement handed to the agent.
    pub fn with_problem_statement(mut self, statement: impl Into<String>) -> Self {
        self.problem_statement = statement.into();
        self
    }

    /// Sets the fail-to-pass and pass-to-pass partitions.
    pub fn with_tests(mut self, fail_to_pass: Vec<String>, pass_to_pass: Vec<String>) -> Self {
        self.fail_to_pass = fail_to_pass;
        self.pass_to_pass = pass_to_pass;
        self
    }

    /// Sets an explicit test command.
    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_command = Some(command.into());
        self
    }

    /// Fills in derived fields left empty by the dataset row.
    pub fn normalized(mut self) -> Self {
        if self.instance_image_key.is_empty() {
            self.instance_image_key = default_image_key(&self.instance_id, DEFAULT_IMAGE_NAMESPACE);
        }
        self
    }

    /// Name of the container running `run_id` of this instance.
    pub fn container_name(&self, run_id: &str) -> String {
        let raw = format!("sweb.eval.{}.{}", self.instance_id, run_id);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Cache key path component: `<repo with '/' replaced>/<version>`.
    pub fn cache_key(&self) -> (String, String) {
        let version = if self.version.is_empty() {
            "unversioned".to_string()
        } else {
            self.version.clone()
        };
        (self.repo.replace('/', "_"), version)
    }

    /// Files touched by the test patch, in patch order, without duplicates.
    pub fn test_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for caps in DIFF_HEADER.captures_iter(&self.test_patch) {
            let path = caps[1].to_string();
            if !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }

    /// Test targets to pass to the test runner, derived from the test patch.
    pub fn test_directives(&self) -> Vec<String> {
        let files = self
            .test_files()
            .into_iter()
            .filter(|f| !NON_TEST_EXTENSIONS.iter().any(|ext| f.ends_with(ext)));

        if self.repo == "django/django" {
            files
                .map(|f| {
                    let f = f.strip_suffix(".py").unwrap_or(&f);
                    let f = f.strip_prefix("tests/").unwrap_or(f);
                    f.replace('/', ".")
                })
                .collect()
        } else {
            files.collect()
        }
    }
}

/// Derives the evaluation image reference for an instance.
///
/// Registry names cannot carry `__`, so it is encoded as `_1776_`.
pub fn default_image_key(instance_id: &str, namespace: &str) -> String {
    let name = format!("sweb.eval.{}.{}", DEFAULT_IMAGE_ARCH, instance_id.to_lowercase())
        .replace("__", "_1776_");
    if namespace.is_empty() {
        format!("{name}:latest")
    } else {
        format!("{namespace}/{name}:latest")
    }
}

/// Accepts strings, numbers and null (SWE-bench rows are not uniform).
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Accepts a JSON array or a string holding a JSON-encoded array.
fn test_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        serde_json::Value::String(s) => serde_json::from_str(&s).map_err(D::Error::custom),
        array @ serde_json::Value::Array(_) => {
            serde_json::from_value(array).map_err(D::Error::custom)
        }
        other => Err(D::Error::custom(format!(
            "expected a list of test names, got {other}"
        ))),
    }
}
