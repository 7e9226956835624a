//! Pipeline state machine and run trace.
//!
//! ```text
//! Initialized -> WorkspaceReady -> PatchProposed -> PatchValidated
//!             -> PatchApplied -> Verified -> Published
//! ```
//!
//! `Failed { stage, reason }` is reachable from every non-terminal state.
//! `Verified` is terminal for dry runs; `Published` and `Failed` always are.

use std::fmt;

use serde::Serialize;

use crate::core::branch::BranchName;
use crate::core::patch::{DiffSummary, PatchKind};
use crate::core::types::{ApplyResult, PublishResult, RunMode, VerifyResult};
use crate::core::validator::ValidationResult;

/// Stage named by a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Workspace,
    Proposal,
    NoChange,
    Validation,
    Apply,
    Verify,
    Publish,
    Cancelled,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Workspace => "workspace",
            Stage::Proposal => "proposal",
            Stage::NoChange => "no_change",
            Stage::Validation => "validation",
            Stage::Apply => "apply",
            Stage::Verify => "verify",
            Stage::Publish => "publish",
            Stage::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Initialized,
    WorkspaceReady,
    PatchProposed,
    PatchValidated,
    PatchApplied,
    Verified,
    Published,
    Failed { stage: Stage, reason: String },
}

impl PipelineState {
    fn rank(&self) -> Option<u8> {
        match self {
            PipelineState::Initialized => Some(0),
            PipelineState::WorkspaceReady => Some(1),
            PipelineState::PatchProposed => Some(2),
            PipelineState::PatchValidated => Some(3),
            PipelineState::PatchApplied => Some(4),
            PipelineState::Verified => Some(5),
            PipelineState::Published => Some(6),
            PipelineState::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineState::Failed { .. })
    }

    /// True if no further transition is allowed in `mode`.
    pub fn is_terminal(&self, mode: RunMode) -> bool {
        match self {
            PipelineState::Published | PipelineState::Failed { .. } => true,
            PipelineState::Verified => mode == RunMode::DryRun,
            _ => false,
        }
    }

    /// True if the run ended in the success state for `mode`.
    pub fn is_success(&self, mode: RunMode) -> bool {
        match mode {
            RunMode::DryRun => *self == PipelineState::Verified,
            RunMode::Apply => *self == PipelineState::Published,
        }
    }

    /// Whether `next` is a legal successor of `self` in `mode`.
    pub fn can_transition_to(&self, next: &PipelineState, mode: RunMode) -> bool {
        if self.is_terminal(mode) {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Initialized => write!(f, "Initialized"),
            PipelineState::WorkspaceReady => write!(f, "WorkspaceReady"),
            PipelineState::PatchProposed => write!(f, "PatchProposed"),
            PipelineState::PatchValidated => write!(f, "PatchValidated"),
            PipelineState::PatchApplied => write!(f, "PatchApplied"),
            PipelineState::Verified => write!(f, "Verified"),
            PipelineState::Published => write!(f, "Published"),
            PipelineState::Failed { stage, .. } => write!(f, "Failed({})", stage.as_str()),
        }
    }
}

/// Immutable record appended by each stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageRecord {
    Branch {
        branch: BranchName,
    },
    Workspace {
        path: String,
        reused: bool,
    },
    Proposal {
        summary: String,
        patch_kind: Option<PatchKind>,
        diff_summary: Option<DiffSummary>,
        direct_edits: Vec<String>,
    },
    Validation(ValidationResult),
    Apply(ApplyResult),
    Verify(VerifyResult),
    Publish(PublishResult),
    Cleanup {
        path: String,
        destroyed: bool,
    },
}

/// Owns the current state plus the ordered trace of stage records.
#[derive(Debug, Clone)]
pub struct RunTrace {
    mode: RunMode,
    state: PipelineState,
    records: Vec<StageRecord>,
}

impl RunTrace {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            state: PipelineState::Initialized,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn record(&mut self, record: StageRecord) {
        self.records.push(record);
    }

    /// Move to the next state. Illegal transitions become a failure instead of
    /// silently skipping a stage.
    pub fn advance(&mut self, next: PipelineState) {
        if self.state.can_transition_to(&next, self.mode) {
            self.state = next;
        } else {
            let reason = format!("illegal transition {} -> {}", self.state, next);
            self.state = PipelineState::Failed {
                stage: stage_after(&self.state),
                reason,
            };
        }
    }

    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        if self.state.is_failed() {
            return;
        }
        self.state = PipelineState::Failed {
            stage,
            reason: reason.into(),
        };
    }

    pub fn into_parts(self) -> (PipelineState, Vec<StageRecord>) {
        (self.state, self.records)
    }
}

fn stage_after(state: &PipelineState) -> Stage {
    match state {
        PipelineState::Initialized => Stage::Workspace,
        PipelineState::WorkspaceReady => Stage::Proposal,
        PipelineState::PatchProposed => Stage::Validation,
        PipelineState::PatchValidated => Stage::Apply,
        PipelineState::PatchApplied => Stage::Verify,
        PipelineState::Verified | PipelineState::Published => Stage::Publish,
        PipelineState::Failed { stage, .. } => *stage,
    }
}
