//! Shared deterministic types for pipeline results.
//!
//! Each stage produces one of these records. Records are never mutated after
//! the stage that produced them returns.

use serde::{Deserialize, Serialize};

use crate::core::branch::BranchName;
use crate::error::VerificationFailure;

/// One invocation's input. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRequest {
    pub raw_instruction: String,
    pub requested_branch: Option<String>,
}

impl ChangeRequest {
    pub fn new(raw_instruction: impl Into<String>) -> Self {
        Self {
            raw_instruction: raw_instruction.into(),
            requested_branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.requested_branch = Some(branch.into());
        self
    }

    /// First non-empty line of the instruction, used for commit and PR titles.
    pub fn headline(&self) -> String {
        self.raw_instruction
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("patchgate change")
            .chars()
            .take(72)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Stop after verification. Nothing is committed or pushed.
    DryRun,
    /// Commit, push and optionally open a change request.
    Apply,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub applied: bool,
    pub failure_detail: Option<String>,
    /// Workspace-relative `.bak` files written before overwriting.
    pub backups: Vec<String>,
}

impl ApplyResult {
    pub fn applied(backups: Vec<String>) -> Self {
        Self {
            applied: true,
            failure_detail: None,
            backups,
        }
    }

    pub fn failed(detail: impl Into<String>, backups: Vec<String>) -> Self {
        Self {
            applied: false,
            failure_detail: Some(detail.into()),
            backups,
        }
    }
}

/// Classification of a single verification command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
    TimedOut,
    Error,
}

/// Outcome of one test or lint command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub label: String,
    pub command: Vec<String>,
    pub passed: bool,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the command could not be run at all.
    pub error: Option<String>,
}

impl CheckResult {
    pub fn outcome(&self) -> CheckOutcome {
        if self.error.is_some() {
            CheckOutcome::Error
        } else if self.timed_out {
            CheckOutcome::TimedOut
        } else if self.passed {
            CheckOutcome::Pass
        } else {
            CheckOutcome::Fail
        }
    }

    pub fn failure(&self) -> Option<VerificationFailure> {
        let label = self.label.clone();
        match self.outcome() {
            CheckOutcome::Pass => None,
            CheckOutcome::Fail => Some(VerificationFailure::Failed {
                label,
                exit_code: self.exit_code,
            }),
            CheckOutcome::TimedOut => Some(VerificationFailure::TimedOut { label }),
            CheckOutcome::Error => Some(VerificationFailure::Error {
                label,
                detail: self.error.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Test and lint results. `None` means the command was skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub test: Option<CheckResult>,
    pub lint: Option<CheckResult>,
}

impl VerifyResult {
    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn failures(&self) -> Vec<VerificationFailure> {
        [&self.test, &self.lint]
            .into_iter()
            .flatten()
            .filter_map(CheckResult::failure)
            .collect()
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        [&self.test, &self.lint]
            .into_iter()
            .flatten()
            .filter(|check| check.outcome() != CheckOutcome::Pass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub pushed: bool,
    pub branch: BranchName,
    pub commit_hash: Option<String>,
    pub pr_url: Option<String>,
}
