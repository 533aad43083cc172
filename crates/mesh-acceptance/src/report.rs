//! Check outcomes, the failure tally and the run report.

use crate::errors::HarnessError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Exit code for a run without failures.
pub const EXIT_PASSED: u8 = 0;

/// Exit code when at least one assertion failed.
pub const EXIT_FAILED: u8 = 1;

/// Exit code when the run was aborted (fatal error or interruption).
pub const EXIT_ABORTED: u8 = 2;

/// Result of a single assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub check: String,
    pub passed: bool,
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(check: &str, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(check: &str, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

/// Accumulator of every outcome in a run.
///
/// `failures()` is the number of failed assertions; nothing else increments it.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Tally {
    outcomes: Vec<CheckOutcome>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `outcome` and return whether it passed.
    pub fn record(&mut self, outcome: CheckOutcome) -> bool {
        let passed = outcome.passed;
        if passed {
            info!(check = %outcome.check, "PASS: {}", outcome.message);
        } else {
            error!(check = %outcome.check, "FAIL: {}", outcome.message);
        }
        self.outcomes.push(outcome);
        passed
    }

    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed).count()
    }

    pub fn passes(&self) -> usize {
        self.outcomes.len() - self.failures()
    }
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed { failures: usize },
    Aborted { reason: String },
}

impl RunStatus {
    /// Status derived from the tally alone.
    pub fn from_tally(tally: &Tally) -> Self {
        match tally.failures() {
            0 => RunStatus::Passed,
            failures => RunStatus::Failed { failures },
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Passed => EXIT_PASSED,
            RunStatus::Failed { .. } => EXIT_FAILED,
            RunStatus::Aborted { .. } => EXIT_ABORTED,
        }
    }
}

/// Serializable summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub failures: usize,
    pub outcomes: Vec<CheckOutcome>,
    /// Working directory, set only when the environment was kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl RunReport {
    pub fn new(
        namespace: &str,
        started_at: DateTime<Utc>,
        tally: &Tally,
        abort_reason: Option<String>,
    ) -> Self {
        let status = match abort_reason {
            Some(reason) => RunStatus::Aborted { reason },
            None => RunStatus::from_tally(tally),
        };
        Self {
            namespace: namespace.to_string(),
            started_at,
            finished_at: Utc::now(),
            status,
            failures: tally.failures(),
            outcomes: tally.outcomes().to_vec(),
            workdir: None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    /// Log the final verdict.
    pub fn log_summary(&self) {
        match &self.status {
            RunStatus::Passed => info!(
                namespace = %self.namespace,
                checks = self.outcomes.len(),
                "Tests passed"
            ),
            RunStatus::Failed { failures } => error!(
                namespace = %self.namespace,
                failures = failures,
                "{} test(s) failed", failures
            ),
            RunStatus::Aborted { reason } => error!(
                namespace = %self.namespace,
                failures = self.failures,
                reason = %reason,
                "Run aborted"
            ),
        }
    }

    /// Write the report as pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<(), HarnessError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::io(path, std::io::Error::other(e)))?;
        fs::write(path, json).map_err(|e| HarnessError::io(path, e))
    }
}
