//! Publisher: commit, push, and open a change request.
//!
//! Push and change-request creation are the only irreversible steps in a run
//! and are never retried here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::PublishResult;
use crate::error::PublishError;
use crate::io::apply::{is_backup_entry, resolve_within};
use crate::io::git::{DEFAULT_GIT_TIMEOUT, Git};
use crate::io::process::{CommandSpec, Mode, run};
use crate::io::workspace::Workspace;

pub const DEFAULT_HOSTING_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of [`Publisher::commit_and_push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Committed and pushed. `pr_url` is not set yet.
    Pushed(PublishResult),
    /// Nothing to commit. Not an error.
    NoChanges,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    remote: String,
    git_timeout: Duration,
}

impl Publisher {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    /// Stage everything, commit, and push the current branch with upstream
    /// tracking.
    ///
    /// `backups` and any other untracked `<file>.bak` next to an existing
    /// `<file>` are deleted first, so a published workspace is left clean.
    /// Other `.bak` files are ordinary content and are committed.
    #[instrument(skip_all, fields(workspace = %workspace.path.display(), remote = %self.remote))]
    pub fn commit_and_push(
        &self,
        message: &str,
        workspace: &Workspace,
        backups: &[String],
    ) -> Result<PublishOutcome, PublishError> {
        let git = Git::new(&workspace.path).with_timeout(self.git_timeout);
        let mut stale: Vec<String> = git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| is_backup_entry(&workspace.path, entry))
            .map(|entry| entry.path)
            .collect();
        stale.extend(backups.iter().cloned());
        remove_backups(&workspace.path, &stale)?;

        git.add_all()?;
        if !git.commit_staged(message)? {
            info!("nothing to commit");
            return Ok(PublishOutcome::NoChanges);
        }
        let commit_hash = git.head_sha()?;

        let branch = git
            .current_branch()?
            .ok_or_else(|| PublishError::DetachedHead {
                path: workspace.path.clone(),
            })?;
        if branch != workspace.branch.as_str() {
            warn!(current = %branch, expected = %workspace.branch, "workspace is on an unexpected branch");
        }
        git.push_set_upstream(&self.remote, &branch)?;

        info!(commit = %commit_hash, branch = %branch, "pushed");
        Ok(PublishOutcome::Pushed(PublishResult {
            pushed: true,
            branch: workspace.branch.clone(),
            commit_hash: Some(commit_hash),
            pr_url: None,
        }))
    }
}

fn remove_backups(root: &Path, backups: &[String]) -> Result<(), PublishError> {
    for rel in backups {
        debug!(path = %rel, "removing backup");
        let Some(path) = resolve_within(root, rel) else {
            continue;
        };
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(PublishError::Backup { path, source }),
        }
    }
    Ok(())
}

/// Parameters for one change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

/// The code-hosting provider. One call, no retries.
pub trait ReviewHost {
    /// Open a change request and return its URL.
    fn open_change_request(
        &self,
        request: &ReviewRequest,
        workdir: &Path,
    ) -> Result<String, PublishError>;
}

/// Opens pull requests through the `gh` command-line client.
#[derive(Debug, Clone)]
pub struct GhCli {
    command: Vec<String>,
    timeout: Duration,
}

impl GhCli {
    /// `command` is the argv prefix, normally `["gh"]`.
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new(vec!["gh".to_string()], DEFAULT_HOSTING_TIMEOUT)
    }
}

impl ReviewHost for GhCli {
    #[instrument(skip_all, fields(base = %request.base, head = %request.head))]
    fn open_change_request(
        &self,
        request: &ReviewRequest,
        workdir: &Path,
    ) -> Result<String, PublishError> {
        let argv = self
            .command
            .iter()
            .map(String::as_str)
            .chain([
                "pr",
                "create",
                "--base",
                &request.base,
                "--head",
                &request.head,
                "--title",
                &request.title,
                "--body",
                &request.body,
            ])
            .map(str::to_string);
        let spec = CommandSpec::new(argv, PathBuf::from(workdir), self.timeout);
        let out = run(&spec, Mode::Lenient).map_err(|e| PublishError::ChangeRequest {
            detail: e.to_string(),
        })?;
        if !out.success() {
            let detail = if out.timed_out {
                format!("timed out after {:?}", self.timeout)
            } else {
                format!(
                    "exit code {:?}\n=== stdout ===\n{}\n=== stderr ===\n{}",
                    out.exit_code(),
                    out.stdout_str(),
                    out.stderr_str()
                )
            };
            return Err(PublishError::ChangeRequest { detail });
        }

        let stdout = out.stdout_str();
        let url = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| PublishError::ChangeRequest {
                detail: "no change request URL in output".to_string(),
            })?;
        info!(url, "change request opened");
        Ok(url.to_string())
    }
}
