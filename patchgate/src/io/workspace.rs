//! Workspace manager: one isolated git worktree per branch.
//!
//! The worktree path is `<worktrees_root>/wt-<branch>`. Callers must hold the
//! branch lock (see [`crate::io::lock`]) for as long as the workspace is in use.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::branch::BranchName;
use crate::error::WorkspaceError;
use crate::io::git::{DEFAULT_GIT_TIMEOUT, Git};

/// An attached worktree owned by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: BranchName,
    pub base_repo: PathBuf,
}

/// What to do when the worktree directory already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingPolicy {
    /// Remove it (and its git bookkeeping) and attach a fresh one. Anything
    /// unpushed in the old directory is lost.
    #[default]
    Recreate,
    /// Keep it if git lists it as a worktree for the same branch.
    Reuse,
    /// Refuse with [`WorkspaceError::Collision`].
    Fail,
}

/// Whether the workspace survives the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepPolicy {
    Never,
    /// Keep it for inspection when the run failed.
    #[default]
    OnFailure,
    Always,
}

impl KeepPolicy {
    pub fn keeps(self, failed: bool) -> bool {
        match self {
            KeepPolicy::Never => false,
            KeepPolicy::OnFailure => failed,
            KeepPolicy::Always => true,
        }
    }
}

/// Result of [`WorkspaceManager::create`].
#[derive(Debug, Clone)]
pub struct CreatedWorkspace {
    pub workspace: Workspace,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    source_repo: PathBuf,
    worktrees_root: PathBuf,
    on_existing: ExistingPolicy,
    git_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(source_repo: impl Into<PathBuf>, worktrees_root: impl Into<PathBuf>) -> Self {
        Self {
            source_repo: source_repo.into(),
            worktrees_root: worktrees_root.into(),
            on_existing: ExistingPolicy::default(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn on_existing(mut self, policy: ExistingPolicy) -> Self {
        self.on_existing = policy;
        self
    }

    pub fn git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    /// Deterministic worktree location for `branch`.
    pub fn path_for(&self, branch: &BranchName) -> PathBuf {
        self.worktrees_root.join(format!("wt-{branch}"))
    }

    fn source_git(&self) -> Git {
        Git::new(&self.source_repo).with_timeout(self.git_timeout)
    }

    /// Attach a worktree for `branch`, creating the branch from HEAD if needed.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn create(&self, branch: &BranchName) -> Result<CreatedWorkspace, WorkspaceError> {
        if branch.is_empty() {
            return Err(WorkspaceError::InvalidBranch {
                input: branch.to_string(),
            });
        }
        let git = self.source_git();
        if !git.is_repository()? {
            return Err(WorkspaceError::NotARepository {
                path: self.source_repo.clone(),
                detail: "git rev-parse --is-inside-work-tree failed".to_string(),
            });
        }

        fs::create_dir_all(&self.worktrees_root).map_err(|source| WorkspaceError::Io {
            context: format!("create {}", self.worktrees_root.display()),
            source,
        })?;
        let path = self.path_for(branch);

        if fs::symlink_metadata(&path).is_ok() {
            match self.on_existing {
                ExistingPolicy::Fail => return Err(WorkspaceError::Collision { path }),
                ExistingPolicy::Reuse => {
                    if self.is_worktree_for(&git, &path, branch)? {
                        info!(path = %path.display(), "reusing existing workspace");
                        return Ok(CreatedWorkspace {
                            workspace: self.workspace(path, branch),
                            reused: true,
                        });
                    }
                    return Err(WorkspaceError::Collision { path });
                }
                ExistingPolicy::Recreate => {
                    warn!(path = %path.display(), "removing stale workspace");
                    self.remove_path(&git, &path)?;
                }
            }
        }
        // A directory deleted by hand stays registered until pruned, and
        // `worktree add` refuses registered paths.
        git.worktree_prune()?;

        if !git.branch_exists(branch.as_str())? {
            git.create_branch(branch.as_str(), "HEAD")?;
        }
        git.worktree_add(&path, branch.as_str())
            .map_err(|source| WorkspaceError::AttachFailed {
                path: path.clone(),
                branch: branch.to_string(),
                source,
            })?;

        info!(path = %path.display(), "workspace created");
        Ok(CreatedWorkspace {
            workspace: self.workspace(path, branch),
            reused: false,
        })
    }

    /// Remove the worktree directory and its git bookkeeping.
    ///
    /// Returns false if there was nothing to remove. Never fails because the
    /// workspace is already gone.
    #[instrument(skip_all, fields(path = %workspace.path.display()))]
    pub fn destroy(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        let git = self.source_git();
        if fs::symlink_metadata(&workspace.path).is_err() {
            git.worktree_prune()?;
            debug!("workspace already destroyed");
            return Ok(false);
        }
        self.remove_path(&git, &workspace.path)?;
        info!("workspace destroyed");
        Ok(true)
    }

    fn remove_path(&self, git: &Git, path: &Path) -> Result<(), WorkspaceError> {
        let removed = git.worktree_remove(path)?;
        if !removed {
            debug!(path = %path.display(), "git did not know the worktree");
        }
        if fs::symlink_metadata(path).is_ok() {
            remove_any(path).map_err(|source| WorkspaceError::Io {
                context: format!("remove {}", path.display()),
                source,
            })?;
        }
        git.worktree_prune()?;
        Ok(())
    }

    fn is_worktree_for(
        &self,
        git: &Git,
        path: &Path,
        branch: &BranchName,
    ) -> Result<bool, WorkspaceError> {
        let wanted = canonical(path);
        Ok(git.worktree_list()?.iter().any(|entry| {
            canonical(&entry.path) == wanted && entry.branch.as_deref() == Some(branch.as_str())
        }))
    }

    fn workspace(&self, path: PathBuf, branch: &BranchName) -> Workspace {
        Workspace {
            path,
            branch: branch.clone(),
            base_repo: self.source_repo.clone(),
        }
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::branch::normalize;
    use crate::test_support::TestRepo;

    #[test]
    fn creates_worktree_on_new_branch() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root());
        let branch = normalize("issue-create");

        let created = manager.create(&branch).expect("create");
        let ws = &created.workspace;
        assert!(!created.reused);
        assert_eq!(ws.path, repo.worktrees_root().join("wt-issue-create"));
        assert!(ws.path.join("README.md").exists());

        let current = Git::new(&ws.path).current_branch().expect("branch");
        assert_eq!(current.as_deref(), Some("issue-create"));
    }

    #[test]
    fn recreate_policy_wipes_stale_directory() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root());
        let branch = normalize("issue-stale");

        let first = manager.create(&branch).expect("first");
        fs::write(first.workspace.path.join("scratch.txt"), "junk").expect("write");

        let second = manager.create(&branch).expect("second");
        assert!(!second.workspace.path.join("scratch.txt").exists());
    }

    #[test]
    fn recreate_handles_plain_directory_at_path() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root());
        let branch = normalize("issue-plain");
        let path = manager.path_for(&branch);
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(path.join("leftover"), "x").expect("write");

        let created = manager.create(&branch).expect("create");
        assert!(!created.workspace.path.join("leftover").exists());
    }

    #[test]
    fn fail_policy_reports_collision() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root())
            .on_existing(ExistingPolicy::Fail);
        let branch = normalize("issue-fail");
        manager.create(&branch).expect("first");
        let err = manager.create(&branch).unwrap_err();
        assert!(matches!(err, WorkspaceError::Collision { .. }));
    }

    #[test]
    fn reuse_policy_keeps_registered_worktree() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root())
            .on_existing(ExistingPolicy::Reuse);
        let branch = normalize("issue-reuse");
        let first = manager.create(&branch).expect("first");
        fs::write(first.workspace.path.join("keep.txt"), "keep").expect("write");

        let second = manager.create(&branch).expect("second");
        assert!(second.reused);
        assert!(second.workspace.path.join("keep.txt").exists());
    }

    #[test]
    fn reuse_policy_refuses_unregistered_directory() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root())
            .on_existing(ExistingPolicy::Reuse);
        let branch = normalize("issue-foreign");
        fs::create_dir_all(manager.path_for(&branch)).expect("mkdir");
        assert!(matches!(
            manager.create(&branch),
            Err(WorkspaceError::Collision { .. })
        ));
    }

    #[test]
    fn rejects_non_repository_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(temp.path(), temp.path().join("wt"));
        let err = manager.create(&normalize("x")).unwrap_err();
        assert!(matches!(err, WorkspaceError::NotARepository { .. }));
    }

    #[test]
    fn branch_checked_out_elsewhere_fails_to_attach() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root());
        let main = normalize("main");
        let err = manager.create(&main).unwrap_err();
        assert!(matches!(err, WorkspaceError::AttachFailed { .. }), "{err}");
    }

    #[test]
    fn destroy_is_idempotent() {
        let repo = TestRepo::new().expect("repo");
        let manager = WorkspaceManager::new(repo.path(), repo.worktrees_root());
        let ws = manager.create(&normalize("issue-gone")).expect("create").workspace;

        assert!(manager.destroy(&ws).expect("destroy"));
        assert!(!ws.path.exists());
        assert!(!manager.destroy(&ws).expect("destroy again"));

        let listed = Git::new(repo.path()).worktree_list().expect("list");
        assert!(listed.iter().all(|entry| entry.branch.as_deref() != Some("issue-gone")));
    }
}
