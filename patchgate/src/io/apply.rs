//! Patch applicator.
//!
//! Diff patches are all-or-nothing: the workspace's tracked state is
//! fingerprinted before the attempt and compared after any failure, and a
//! changed workspace is restored from a snapshot. Content-map patches are
//! written file by file; a failure part-way leaves earlier files written.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::patch::Patch;
use crate::core::types::ApplyResult;
use crate::error::{ApplyError, ProcessError};
use crate::io::git::{DEFAULT_GIT_TIMEOUT, Git, StatusEntry};
use crate::io::workspace::Workspace;

/// Suffix for the copy of a file taken before it is overwritten.
pub const BACKUP_SUFFIX: &str = ".bak";


#[derive(Debug, Clone)]
pub struct Applicator {
    git_timeout: Duration,
}

impl Default for Applicator {
    fn default() -> Self {
        Self {
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

impl Applicator {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }

    /// Apply an already-validated patch to the workspace.
    #[instrument(skip_all, fields(kind = ?patch.kind(), workspace = %workspace.path.display()))]
    pub fn apply(&self, patch: &Patch, workspace: &Workspace) -> Result<ApplyResult, ApplyError> {
        match patch {
            Patch::Diff(diff) => self.apply_diff(diff, workspace),
            Patch::Files(files) => {
                let mut backups = Vec::new();
                for (rel, content) in files {
                    if let Some(backup) = write_with_backup(&workspace.path, rel, content, true)? {
                        backups.push(backup);
                    }
                }
                info!(files = files.len(), backups = backups.len(), "content map applied");
                Ok(ApplyResult::applied(backups))
            }
        }
    }

    fn apply_diff(&self, diff: &str, workspace: &Workspace) -> Result<ApplyResult, ApplyError> {
        let git = Git::new(&workspace.path).with_timeout(self.git_timeout);
        let before = fingerprint(&git)?;
        let snapshot = git.stash_create()?;

        let check = git.apply_index(diff, true)?;
        if !check.success() {
            let detail = rejection_detail(&check.stderr_str(), check.timed_out);
            self.ensure_unchanged(&git, &before, snapshot.as_deref())?;
            warn!(%detail, "patch rejected by apply --check");
            return Err(ApplyError::DoesNotApply { detail });
        }

        let applied = git.apply_index(diff, false)?;
        if !applied.success() {
            let detail = rejection_detail(&applied.stderr_str(), applied.timed_out);
            self.ensure_unchanged(&git, &before, snapshot.as_deref())?;
            warn!(%detail, "patch failed to apply");
            return Err(ApplyError::DoesNotApply { detail });
        }

        info!("diff applied to index and working tree");
        Ok(ApplyResult::applied(Vec::new()))
    }

    /// Verify a failed attempt left tracked state untouched, restoring the
    /// snapshot if it did not.
    fn ensure_unchanged(
        &self,
        git: &Git,
        before: &str,
        snapshot: Option<&str>,
    ) -> Result<(), ApplyError> {
        if fingerprint(git)? == before {
            debug!("workspace unchanged after failed apply");
            return Ok(());
        }
        warn!("failed apply changed the workspace, restoring snapshot");
        git.reset_hard()?;
        if let Some(sha) = snapshot {
            git.stash_apply_index(sha)?;
        }
        if fingerprint(git)? != before {
            return Err(ApplyError::NotRestored {
                detail: "tracked state differs after restore".to_string(),
            });
        }
        Ok(())
    }
}

fn rejection_detail(stderr: &str, timed_out: bool) -> String {
    if timed_out {
        return "git apply timed out".to_string();
    }
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "git apply refused the patch".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Hash of the tracked state: status plus index and working-tree diffs.
fn fingerprint(git: &Git) -> Result<String, ProcessError> {
    let mut hasher = Sha256::new();
    for entry in git.status_porcelain()? {
        if entry.code == "??" {
            continue;
        }
        hasher.update(entry.code.as_bytes());
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(git.diff_binary(true)?);
    hasher.update(b"\0");
    hasher.update(git.diff_binary(false)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve a workspace-relative path, refusing anything that would leave `root`.
pub fn resolve_within(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    let inside = !rel.is_empty()
        && rel_path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    inside.then(|| root.join(rel_path))
}

/// True for an untracked `<file>.bak` next to an existing `<file>`, the shape
/// every backup written by [`write_with_backup`] has.
pub fn is_backup_entry(root: &Path, entry: &StatusEntry) -> bool {
    entry.code == "??"
        && entry
            .path
            .strip_suffix(BACKUP_SUFFIX)
            .filter(|original| !original.is_empty())
            .and_then(|original| resolve_within(root, original))
            .is_some_and(|original| original.is_file())
}

/// Write `content` to `root/rel`, creating parents. When `backup` is set and
/// the file exists, it is first copied to a `.bak` sibling whose
/// workspace-relative path is returned.
pub fn write_with_backup(
    root: &Path,
    rel: &str,
    content: &str,
    backup: bool,
) -> Result<Option<String>, ApplyError> {
    let target = resolve_within(root, rel).ok_or_else(|| ApplyError::Write {
        path: PathBuf::from(rel),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path escapes the workspace",
        ),
    })?;
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ApplyError::Write { path, source }
    };

    let mut backup_rel = None;
    if backup && target.is_file() {
        let rel_backup = format!("{rel}{BACKUP_SUFFIX}");
        let backup_path = root.join(&rel_backup);
        fs::copy(&target, &backup_path).map_err(write_err(&backup_path))?;
        debug!(path = %backup_path.display(), "backup written");
        backup_rel = Some(rel_backup);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(write_err(parent))?;
    }
    fs::write(&target, content).map_err(write_err(&target))?;
    Ok(backup_rel)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::branch::normalize;
    use crate::io::workspace::WorkspaceManager;
    use crate::test_support::TestRepo;

    fn workspace(repo: &TestRepo, name: &str) -> Workspace {
        WorkspaceManager::new(repo.path(), repo.worktrees_root())
            .create(&normalize(name))
            .expect("create workspace")
            .workspace
    }

    fn tracked_snapshot(ws: &Workspace) -> (String, String) {
        let git = Git::new(&ws.path);
        let readme = fs::read_to_string(ws.path.join("README.md")).expect("read");
        let status = git
            .status_porcelain()
            .expect("status")
            .into_iter()
            .map(|e| format!("{} {}", e.code, e.path))
            .collect::<Vec<_>>()
            .join("\n");
        (readme, status)
    }

    #[test]
    fn content_map_writes_file_and_backup() {
        let repo = TestRepo::new().expect("repo");
        let ws = workspace(&repo, "issue-map");
        fs::create_dir_all(ws.path.join("src/app")).expect("mkdir");
        fs::write(ws.path.join("src/app/config.txt"), "old-content").expect("seed");

        let patch = Patch::Files(BTreeMap::from([(
            "src/app/config.txt".to_string(),
            "new-content".to_string(),
        )]));
        let result = Applicator::default().apply(&patch, &ws).expect("apply");

        assert!(result.applied);
        assert_eq!(result.backups, vec!["src/app/config.txt.bak".to_string()]);
        let written = fs::read_to_string(ws.path.join("src/app/config.txt")).expect("read");
        assert_eq!(written, "new-content");
        let backup = fs::read_to_string(ws.path.join("src/app/config.txt.bak")).expect("read");
        assert_eq!(backup, "old-content");
    }

    #[test]
    fn content_map_creates_parents_without_backup_for_new_files() {
        let repo = TestRepo::new().expect("repo");
        let ws = workspace(&repo, "issue-new-file");
        let patch = Patch::Files(BTreeMap::from([(
            "src/deep/nested/new.txt".to_string(),
            "hello".to_string(),
        )]));
        let result = Applicator::default().apply(&patch, &ws).expect("apply");
        assert!(result.backups.is_empty());
        assert_eq!(
            fs::read_to_string(ws.path.join("src/deep/nested/new.txt")).expect("read"),
            "hello"
        );
    }

    #[test]
    fn content_map_refuses_escaping_paths() {
        let repo = TestRepo::new().expect("repo");
        let ws = workspace(&repo, "issue-escape");
        let patch = Patch::Files(BTreeMap::from([(
            "../outside.txt".to_string(),
            "x".to_string(),
        )]));
        let err = Applicator::default().apply(&patch, &ws).unwrap_err();
        assert!(matches!(err, ApplyError::Write { .. }));
        assert!(!repo.worktrees_root().join("outside.txt").exists());
    }

    #[test]
    fn diff_applies_to_index_and_tree() {
        let repo = TestRepo::new().expect("repo");
        let ws = workspace(&repo, "issue-diff");
        let diff = "\
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# test repo
+# patched repo
";
        let result = Applicator::default()
            .apply(&Patch::Diff(diff.to_string()), &ws)
            .expect("apply");
        assert!(result.applied);
        assert_eq!(
            fs::read_to_string(ws.path.join("README.md")).expect("read"),
            "# patched repo\n"
        );
        assert!(Git::new(&ws.path).has_staged_changes().expect("staged"));
    }

    #[test]
    fn failed_diff_leaves_tracked_state_identical() {
        let repo = TestRepo::new().expect("repo");
        let ws = workspace(&repo, "issue-bad-diff");
        fs::write(ws.path.join("README.md"), "# local edit\n").expect("edit");
        let before = tracked_snapshot(&ws);

        // First hunk applies cleanly, second has mismatched context.
        let diff = "\
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# local edit
+# changed
--- a/src/lib.txt
+++ b/src/lib.txt
@@ -1 +1 @@
-this line does not exist
+replacement
";
        let err = Applicator::default()
            .apply(&Patch::Diff(diff.to_string()), &ws)
            .unwrap_err();
        assert!(matches!(err, ApplyError::DoesNotApply { .. }), "{err}");
        assert_eq!(tracked_snapshot(&ws), before);
    }

    #[test]
    fn resolve_within_rejects_traversal_and_absolute() {
        let root = Path::new("/ws");
        assert_eq!(
            resolve_within(root, "src/a.rs"),
            Some(PathBuf::from("/ws/src/a.rs"))
        );
        assert_eq!(resolve_within(root, "../a"), None);
        assert_eq!(resolve_within(root, "/etc/passwd"), None);
        assert_eq!(resolve_within(root, ""), None);
    }

    #[test]
    fn backup_entries_need_an_untracked_sibling_of_an_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/a.txt"), "a").expect("seed");
        let entry = |code: &str, path: &str| StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        };

        assert!(is_backup_entry(temp.path(), &entry("??", "src/a.txt.bak")));
        assert!(!is_backup_entry(temp.path(), &entry(" M", "src/a.txt.bak")));
        assert!(!is_backup_entry(temp.path(), &entry("??", "src/orphan.bak")));
        assert!(!is_backup_entry(temp.path(), &entry("??", ".bak")));
        assert!(!is_backup_entry(temp.path(), &entry("??", "../src/a.txt.bak")));
    }
}
