//! Git adapter.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every call goes
//! through the command runner with a timeout and a discrete argv.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::ProcessError;
use crate::io::process::{CommandOutput, CommandSpec, Mode, run};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Parsed `git worktree list --porcelain` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for detached or bare entries.
    pub branch: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True if the workdir is inside a git work tree.
    pub fn is_repository(&self) -> Result<bool, ProcessError> {
        if !self.workdir.is_dir() {
            return Ok(false);
        }
        let out = self.run(&["rev-parse", "--is-inside-work-tree"], Mode::Lenient)?;
        Ok(out.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    /// Absolute path of the top of the work tree.
    pub fn toplevel(&self) -> Result<String, ProcessError> {
        self.run_capture(&["rev-parse", "--show-toplevel"])
    }

    /// Return the current branch name, or `None` on a detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>, ProcessError> {
        let name = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        debug!(branch = %name, "current branch");
        Ok(Some(name))
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String, ProcessError> {
        self.run_capture(&["rev-parse", "HEAD"])
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, ProcessError> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_status_line)
            .collect())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, ProcessError> {
        let reference = format!("refs/heads/{branch}");
        let out = self.run(
            &["show-ref", "--verify", "--quiet", &reference],
            Mode::Lenient,
        )?;
        if out.timed_out {
            return Err(timed_out(&out, self.timeout));
        }
        Ok(out.status.success())
    }

    /// Create a branch at `start_point` without checking it out.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn create_branch(&self, branch: &str, start_point: &str) -> Result<(), ProcessError> {
        debug!(branch, start_point, "creating branch");
        self.run(&["branch", branch, start_point], Mode::Strict)?;
        Ok(())
    }

    /// Attach a worktree at `path` with `branch` checked out.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<(), ProcessError> {
        let path = path.to_string_lossy();
        self.run(&["worktree", "add", &path, branch], Mode::Strict)?;
        Ok(())
    }

    /// Remove a worktree. Returns false if git did not know about it.
    pub fn worktree_remove(&self, path: &Path) -> Result<bool, ProcessError> {
        let path = path.to_string_lossy();
        let out = self.run(&["worktree", "remove", "--force", &path], Mode::Lenient)?;
        if out.timed_out {
            return Err(timed_out(&out, self.timeout));
        }
        Ok(out.status.success())
    }

    /// Drop bookkeeping for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<(), ProcessError> {
        self.run(&["worktree", "prune"], Mode::Strict)?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, ProcessError> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Run `git apply --index` with the patch on stdin.
    ///
    /// With `check_only`, nothing is modified. The raw output is returned so the
    /// caller can report why a patch was refused.
    pub fn apply_index(&self, diff: &str, check_only: bool) -> Result<CommandOutput, ProcessError> {
        let mut args = vec!["apply", "--index", "-p1", "--whitespace=nowarn"];
        if check_only {
            args.push("--check");
        }
        args.push("-");
        let spec = self.spec(&args).stdin(diff.as_bytes().to_vec());
        run(&spec, Mode::Lenient)
    }

    /// `git diff` of the working tree (or the index with `cached`) against HEAD.
    pub fn diff_binary(&self, cached: bool) -> Result<Vec<u8>, ProcessError> {
        let args: &[&str] = if cached {
            &["diff", "--cached", "--binary", "HEAD"]
        } else {
            &["diff", "--binary", "HEAD"]
        };
        Ok(self.run(args, Mode::Strict)?.stdout)
    }

    /// Snapshot tracked changes (index and working tree) as a dangling stash
    /// commit without touching either. `None` when there is nothing to save.
    pub fn stash_create(&self) -> Result<Option<String>, ProcessError> {
        let sha = self.run_capture(&["stash", "create"])?;
        Ok((!sha.is_empty()).then_some(sha))
    }

    /// Reset index and tracked files to HEAD. Untracked files are kept.
    pub fn reset_hard(&self) -> Result<(), ProcessError> {
        self.run(&["reset", "--hard", "--quiet", "HEAD"], Mode::Strict)?;
        Ok(())
    }

    /// Re-apply a snapshot from [`Git::stash_create`], index included.
    pub fn stash_apply_index(&self, sha: &str) -> Result<(), ProcessError> {
        self.run(&["stash", "apply", "--index", "--quiet", sha], Mode::Strict)?;
        Ok(())
    }

    /// Stage every change in the worktree, untracked files included.
    pub fn add_all(&self) -> Result<(), ProcessError> {
        self.run(&["add", "-A", "--", "."], Mode::Strict)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool, ProcessError> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool, ProcessError> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run(&["commit", "-m", message], Mode::Strict)?;
        Ok(true)
    }

    /// Push `branch` to `remote`, creating the upstream tracking reference.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_set_upstream(&self, remote: &str, branch: &str) -> Result<(), ProcessError> {
        debug!(remote, branch, "pushing");
        self.run(&["push", "--set-upstream", remote, branch], Mode::Strict)?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, ProcessError> {
        let output = self.run(args, Mode::Strict)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: &[&str], mode: Mode) -> Result<CommandOutput, ProcessError> {
        run(&self.spec(args), mode)
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        let argv = ["git", "-c", "core.quotepath=false"]
            .into_iter()
            .chain(args.iter().copied());
        CommandSpec::new(argv, &self.workdir, self.timeout)
    }
}

fn timed_out(out: &CommandOutput, timeout: Duration) -> ProcessError {
    ProcessError::TimedOut {
        command: out.command.clone(),
        timeout,
        stdout: out.stdout_str(),
        stderr: out.stderr_str(),
    }
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        warn!(line, "unexpected porcelain line");
        return None;
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim();
    }
    Some(StatusEntry {
        code,
        path: unquote(path),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .map(|p| p.replace("\\\"", "\"").replace("\\\\", "\\"))
        .unwrap_or_else(|| path.to_string())
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(short.to_string());
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn unquotes_special_paths() {
        let e = parse_status_line("?? \"with \\\"quote\\\".txt\"").expect("parse");
        assert_eq!(e.path, "with \"quote\".txt");
    }

    #[test]
    fn parses_worktree_list_porcelain() {
        let out = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /tmp/wt-issue-x
HEAD 2222222222222222222222222222222222222222
branch refs/heads/issue-x

worktree /tmp/detached
HEAD 3333333333333333333333333333333333333333
detached
";
        let entries = parse_worktree_list(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].path, PathBuf::from("/tmp/wt-issue-x"));
        assert_eq!(entries[1].branch.as_deref(), Some("issue-x"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn non_repository_is_reported_as_false() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        assert!(!git.is_repository().expect("rev-parse"));
        let missing = Git::new(temp.path().join("missing"));
        assert!(!missing.is_repository().expect("missing dir"));
    }
}
