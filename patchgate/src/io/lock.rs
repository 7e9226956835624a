//! Per-branch mutual exclusion.
//!
//! Workspace paths are a function of the branch name and workspace creation is
//! destructive, so two runs on the same branch must never overlap. Runs in the
//! same process coordinate through [`BranchLocks`]; runs in other processes are
//! caught by a `wt-<branch>.lock` file next to the worktree.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::branch::BranchName;
use crate::error::WorkspaceError;

/// What to do when the branch is already held by another run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Block until the other run in this process releases the branch.
    Wait,
    /// Fail immediately with [`WorkspaceError::Locked`].
    #[default]
    FailFast,
}

/// Registry of branches with a run in flight in this process.
#[derive(Debug, Clone, Default)]
pub struct BranchLocks {
    inner: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `branch` for the lifetime of the returned guard.
    ///
    /// Also takes the on-disk lock file under `lock_dir`, which always fails
    /// fast: another process holding it cannot be waited on.
    pub fn acquire(
        &self,
        branch: &BranchName,
        lock_dir: &Path,
        policy: LockPolicy,
    ) -> Result<BranchGuard, WorkspaceError> {
        let (set, condvar) = &*self.inner;
        let mut held = lock_set(set);
        while held.contains(branch.as_str()) {
            match policy {
                LockPolicy::FailFast => {
                    return Err(WorkspaceError::Locked {
                        branch: branch.to_string(),
                        holder: "another run in this process".to_string(),
                    });
                }
                LockPolicy::Wait => {
                    debug!(branch = %branch, "waiting for branch lock");
                    held = condvar
                        .wait(held)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
        }
        held.insert(branch.to_string());
        drop(held);

        let mut guard = BranchGuard {
            locks: self.clone(),
            branch: branch.to_string(),
            lock_file: None,
        };
        guard.lock_file = Some(take_lock_file(branch, lock_dir)?);
        debug!(branch = %branch, "branch lock acquired");
        Ok(guard)
    }

    pub fn is_held(&self, branch: &BranchName) -> bool {
        lock_set(&self.inner.0).contains(branch.as_str())
    }

    fn release(&self, branch: &str) {
        let (set, condvar) = &*self.inner;
        lock_set(set).remove(branch);
        condvar.notify_all();
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Path of the cross-process lock file for `branch`.
pub fn lock_file_path(lock_dir: &Path, branch: &BranchName) -> PathBuf {
    lock_dir.join(format!("wt-{branch}.lock"))
}

fn take_lock_file(branch: &BranchName, lock_dir: &Path) -> Result<PathBuf, WorkspaceError> {
    fs::create_dir_all(lock_dir).map_err(|source| WorkspaceError::Io {
        context: format!("create {}", lock_dir.display()),
        source,
    })?;
    let path = lock_file_path(lock_dir, branch);
    let mut reclaimed = false;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    warn!(err = %e, path = %path.display(), "failed to write lock owner");
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&path).unwrap_or_default();
                let owner = owner.trim();
                if reclaimed || !owner_is_gone(owner) {
                    return Err(WorkspaceError::Locked {
                        branch: branch.to_string(),
                        holder: format!("pid {owner} via {}", path.display()),
                    });
                }
                warn!(branch = %branch, pid = owner, path = %path.display(), "removing stale lock file");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(WorkspaceError::Io {
                            context: format!("remove {}", path.display()),
                            source,
                        });
                    }
                }
                reclaimed = true;
            }
            Err(source) => {
                return Err(WorkspaceError::Io {
                    context: format!("create {}", path.display()),
                    source,
                });
            }
        }
    }
}

/// True when the recorded owner is a pid that no longer exists. An unreadable
/// owner, or one we may not signal, counts as alive.
fn owner_is_gone(owner: &str) -> bool {
    let Some(pid) = owner.parse::<i32>().ok().filter(|pid| *pid > 0) else {
        return false;
    };
    process_is_gone(pid)
}

#[cfg(unix)]
fn process_is_gone(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_is_gone(_pid: i32) -> bool {
    false
}

/// Holds a branch until dropped.
#[derive(Debug)]
pub struct BranchGuard {
    locks: BranchLocks,
    branch: String,
    lock_file: Option<PathBuf>,
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        if let Some(path) = self.lock_file.take()
            && let Err(e) = fs::remove_file(&path)
        {
            warn!(err = %e, path = %path.display(), "failed to remove lock file");
        }
        self.locks.release(&self.branch);
        debug!(branch = %self.branch, "branch lock released");
    }
}
