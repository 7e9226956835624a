//! Typed failures for each pipeline stage.
//!
//! Every stage returns its own error kind. Only the pipeline orchestrator turns
//! one of these into a terminal [`PipelineState::Failed`](crate::core::state::PipelineState).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a child process invocation.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command}: {detail}")]
    Io { command: String, detail: String },
    #[error("{command} failed with exit code {exit_code:?}\n=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}")]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("{command} timed out after {timeout:?}\n=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}")]
    TimedOut {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Captured stderr, when the process got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } | Self::TimedOut { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{} is not a git repository: {detail}", .path.display())]
    NotARepository { path: PathBuf, detail: String },
    #[error("invalid branch name derived from '{input}'")]
    InvalidBranch { input: String },
    #[error("branch '{branch}' is locked by another run ({holder})")]
    Locked { branch: String, holder: String },
    #[error("workspace {} already exists", .path.display())]
    Collision { path: PathBuf },
    #[error("attach worktree {} for '{branch}': {source}", .path.display())]
    AttachFailed {
        path: PathBuf,
        branch: String,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Git(#[from] ProcessError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("paths outside the allow-list: {}", .rejected_paths.join(", "))]
    Rejected { rejected_paths: Vec<String> },
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("patch does not apply: {detail}")]
    DoesNotApply { detail: String },
    #[error("workspace changed by a failed apply and could not be restored: {detail}")]
    NotRestored { detail: String },
    #[error("write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Git(#[from] ProcessError),
}

/// A verification command that did not pass.
#[derive(Debug, Error)]
pub enum VerificationFailure {
    #[error("{label} failed with exit code {exit_code:?}")]
    Failed { label: String, exit_code: Option<i32> },
    #[error("{label} timed out")]
    TimedOut { label: String },
    #[error("{label} could not run: {detail}")]
    Error { label: String, detail: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("detached HEAD in {}", .path.display())]
    DetachedHead { path: PathBuf },
    #[error("open change request: {detail}")]
    ChangeRequest { detail: String },
    #[error("remove backup {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Git(#[from] ProcessError),
}

#[derive(Debug, Error)]
pub enum ProposerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("proposer wrote no response at {}", .path.display())]
    MissingResponse { path: PathBuf },
    #[error("unusable proposer response: {detail}")]
    InvalidResponse { detail: String },
    #[error("proposer unavailable: {detail}")]
    Unavailable { detail: String },
}
