//! Outcome of one trial.

use serde::{Deserialize, Serialize};

use crate::instance::Instance;

/// Immutable record of a completed trial.
///
/// `success == false` alone is not a failure: it means the agent's change
/// did not resolve the task. Failures are infrastructure or validation
/// problems that make the outcome untrustworthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialResult {
    /// The task this trial ran, embedded so the record is self-contained.
    pub instance: Instance,
    /// The sandbox or a setup step broke before the outcome was known.
    pub run_failed: bool,
    /// Tests ran but their output cannot be trusted.
    pub validation_failed: bool,
    /// Every fail-to-pass and pass-to-pass test passed.
    pub success: bool,
    pub error: Option<String>,
    /// Agent's diff against the baseline; empty if never extracted.
    pub patch: String,
}

impl TrialResult {
    /// A trial that produced a classification.
    pub fn evaluated(instance: Instance, success: bool, patch: impl Into<String>) -> Self {
        Self {
            instance,
            run_failed: false,
            validation_failed: false,
            success,
            error: None,
            patch: patch.into(),
        }
    }

    /// A trial aborted by an infrastructure or setup failure.
    pub fn run_failure(
        instance: Instance,
        error: impl Into<String>,
        patch: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            run_failed: true,
            validation_failed: false,
            success: false,
            error: Some(error.into()),
            patch: patch.into(),
        }
    }

    /// A trial whose test output could not be validated.
    pub fn validation_failure(
        instance: Instance,
        error: impl Into<String>,
        patch: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            run_failed: false,
            validation_failed: true,
            success: false,
            error: Some(error.into()),
            patch: patch.into(),
        }
    }

    /// Whether this result should be excluded from submissions.
    pub fn failed(&self) -> bool {
        self.run_failed || self.validation_failed || self.error.is_some()
    }

    /// Resolved means evaluated, trusted and successful.
    pub fn resolved(&self) -> bool {
        self.success && !self.failed()
    }

    /// Pretty JSON (2-space indent).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A submission entry: the agent's patch for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
}

impl Prediction {
    pub fn new(
        instance_id: impl Into<String>,
        model_name_or_path: impl Into<String>,
        model_patch: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            model_name_or_path: model_name_or_path.into(),
            model_patch: model_patch.into(),
            run_name: None,
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }
}
