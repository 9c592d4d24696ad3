//! Test execution commands, log parsing and outcome classification.
//!
//! A trial is resolved when every fail-to-pass and every pass-to-pass test
//! passes. A test that never shows up in the parsed output makes the whole
//! classification untrustworthy, which is reported as a [`ValidationError`]
//! rather than as an unresolved outcome.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::EvaluationSettings;
use crate::error::ValidationError;
use crate::instance::Instance;
use crate::sandbox::shell_quote;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex is valid"));

static DJANGO_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+ \([\w.]+\))(?: \S.*?)? \.\.\. (ok|OK|FAIL|ERROR|skipped.*|expected failure|unexpected success)\s*$")
        .expect("django result regex is valid")
});

static DJANGO_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(FAIL|ERROR): (\S+ \([\w.]+\))").expect("django header regex is valid")
});

/// Result of one test case as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    /// Expected failure.
    XFail,
}

impl TestStatus {
    /// Whether the status satisfies a fail-to-pass or pass-to-pass check.
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Passed | Self::XFail)
    }
}

/// Parses a test runner's log into per-test statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogParser {
    /// `pytest -rA` short summary and verbose lines.
    Pytest,
    /// Django `runtests.py --verbosity 2`.
    Django,
    /// SymPy `bin/test --verbose`.
    Sympy,
}

impl LogParser {
    /// Picks the parser for a repository.
    pub fn for_repo(repo: &str) -> Self {
        match repo {
            "django/django" => Self::Django,
            "sympy/sympy" => Self::Sympy,
            _ => Self::Pytest,
        }
    }

    pub fn parse(self, log: &str) -> BTreeMap<String, TestStatus> {
        let clean = ANSI_ESCAPE.replace_all(log, "");
        let mut statuses = BTreeMap::new();
        for line in clean.lines() {
            let parsed = match self {
                Self::Pytest => parse_pytest_line(line),
                Self::Django => parse_django_line(line),
                Self::Sympy => parse_sympy_line(line),
            };
            if let Some((name, status)) = parsed {
                statuses.insert(name, status);
            }
        }
        statuses
    }
}

fn pytest_status(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XPASS" => Some(TestStatus::Passed),
        "FAILED" => Some(TestStatus::Failed),
        "SKIPPED" => Some(TestStatus::Skipped),
        "ERROR" => Some(TestStatus::Error),
        "XFAIL" => Some(TestStatus::XFail),
        _ => None,
    }
}

fn parse_pytest_line(line: &str) -> Option<(String, TestStatus)> {
    let line = line.trim_end();

    // Short summary: `PASSED tests/test_x.py::test_y` or `FAILED id - message`.
    if let Some((word, rest)) = line.split_once(' ') {
        if let Some(status) = pytest_status(word) {
            let name = rest.split(" - ").next().unwrap_or(rest).trim();
            if !name.is_empty() && !name.starts_with('[') {
                return Some((name.to_string(), status));
            }
        }
    }

    // Verbose: `tests/test_x.py::test_y PASSED [ 10%]`.
    let without_progress = match line.rfind(" [") {
        Some(idx) if line.ends_with("%]") => &line[..idx],
        _ => line,
    };
    let (name, word) = without_progress.trim_end().rsplit_once(' ')?;
    if !name.contains("::") {
        return None;
    }
    pytest_status(word).map(|status| (name.trim().to_string(), status))
}

fn parse_django_line(line: &str) -> Option<(String, TestStatus)> {
    let line = line.trim_end();
    if let Some(caps) = DJANGO_RESULT.captures(line) {
        let status = match &caps[2] {
            "ok" | "OK" => TestStatus::Passed,
            "FAIL" | "unexpected success" => TestStatus::Failed,
            "ERROR" => TestStatus::Error,
            "expected failure" => TestStatus::XFail,
            _ => TestStatus::Skipped,
        };
        return Some((caps[1].to_string(), status));
    }
    DJANGO_HEADER.captures(line).map(|caps| {
        let status = if &caps[1] == "FAIL" {
            TestStatus::Failed
        } else {
            TestStatus::Error
        };
        (caps[2].to_string(), status)
    })
}

fn parse_sympy_line(line: &str) -> Option<(String, TestStatus)> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    let marker = parts.next()?;
    if parts.next().is_some() || !name.starts_with("test_") {
        return None;
    }
    let status = match marker {
        "ok" => TestStatus::Passed,
        "F" => TestStatus::Failed,
        "E" => TestStatus::Error,
        "f" => TestStatus::XFail,
        "s" | "w" => TestStatus::Skipped,
        _ => return None,
    };
    Some((name.to_string(), status))
}

/// Base test command for a repository when the instance has no override.
pub fn default_test_command(repo: &str) -> &'static str {
    match repo {
        "django/django" => "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1",
        "sympy/sympy" => {
            "PYTHONWARNINGS='ignore::UserWarning,ignore::SyntaxWarning' bin/test -C --verbose"
        }
        "sphinx-doc/sphinx" => "tox --current-env -epy39 -v --",
        _ => "pytest --no-header -rA --tb=no -p no:cacheprovider",
    }
}

/// Full shell command that runs an instance's tests.
pub fn test_command(instance: &Instance, settings: &EvaluationSettings) -> String {
    let command = match &instance.test_command {
        Some(command) => command.clone(),
        None => {
            let directives: Vec<String> = instance
                .test_directives()
                .iter()
                .map(|d| shell_quote(d))
                .collect();
            let base = default_test_command(&instance.repo);
            if directives.is_empty() {
                base.to_string()
            } else {
                format!("{} {}", base, directives.join(" "))
            }
        }
    };

    if settings.test_preamble.trim().is_empty() {
        command
    } else {
        format!("{} && {}", settings.test_preamble, command)
    }
}

/// Per-set outcome of the expected tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSetReport {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub missing: Vec<String>,
}

impl TestSetReport {
    fn build(expected: &[String], statuses: &BTreeMap<String, TestStatus>) -> Self {
        let mut report = Self::default();
        for name in expected {
            match statuses.get(name) {
                Some(status) if status.is_pass() => report.passed.push(name.clone()),
                Some(_) => report.failed.push(name.clone()),
                None => report.missing.push(name.clone()),
            }
        }
        report
    }

    fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.missing.len()
    }

    fn all_passed(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// What the test run says about one trial; persisted as `report.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub instance_id: String,
    pub log_parser: LogParser,
    /// Number of test cases the parser recognised.
    pub parsed_tests: usize,
    pub empty_output: bool,
    pub fail_to_pass: TestSetReport,
    pub pass_to_pass: TestSetReport,
}

impl EvaluationReport {
    /// Classifies raw test output against an instance's expectations.
    pub fn from_output(instance: &Instance, output: &str) -> Self {
        let log_parser = LogParser::for_repo(&instance.repo);
        let statuses = log_parser.parse(output);

        Self {
            instance_id: instance.instance_id.clone(),
            log_parser,
            parsed_tests: statuses.len(),
            empty_output: output.trim().is_empty(),
            fail_to_pass: TestSetReport::build(&instance.fail_to_pass, &statuses),
            pass_to_pass: TestSetReport::build(&instance.pass_to_pass, &statuses),
        }
    }

    /// Every expected test that the output never mentioned.
    pub fn missing(&self) -> Vec<String> {
        self.fail_to_pass
            .missing
            .iter()
            .chain(&self.pass_to_pass.missing)
            .cloned()
            .collect()
    }

    /// `Ok(success)` when the report can be trusted.
    pub fn verdict(&self) -> Result<bool, ValidationError> {
        if self.fail_to_pass.total() + self.pass_to_pass.total() == 0 {
            return Err(ValidationError::NoExpectedTests);
        }
        if self.empty_output {
            return Err(ValidationError::EmptyOutput);
        }
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(ValidationError::MissingTests(missing));
        }
        Ok(self.fail_to_pass.all_passed() && self.pass_to_pass.all_passed())
    }
}
