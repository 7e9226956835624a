//! Test-only fixtures: a real git repository with a bare remote, a scripted
//! proposer, and a hosting client that records what it was asked to open.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::patch::Patch;
use crate::error::{PublishError, ProposerError};
use crate::io::config::PatchgateConfig;
use crate::io::process::{CommandSpec, Mode, run};
use crate::io::proposer::{Proposal, ProposalRequest, Proposer, ProposerEvent};
use crate::io::publish::{ReviewHost, ReviewRequest};

/// Initial README content committed by [`TestRepo::new`].
pub const README: &str = "# test repo\n";

/// A git repository on `main` with one commit and a bare `origin` remote,
/// all inside one temp dir.
pub struct TestRepo {
    _temp: TempDir,
    repo: PathBuf,
    origin: PathBuf,
    worktrees: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let repo = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        let worktrees = temp.path().join("worktrees");
        fs::create_dir_all(&repo).context("create repo dir")?;

        git(&repo, &["init", "-q"])?;
        git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&repo, &["config", "user.email", "tests@patchgate.invalid"])?;
        git(&repo, &["config", "user.name", "patchgate tests"])?;
        git(&repo, &["config", "commit.gpgsign", "false"])?;
        fs::write(repo.join("README.md"), README).context("write README")?;
        git(&repo, &["add", "README.md"])?;
        git(&repo, &["commit", "-q", "-m", "initial"])?;

        git(temp.path(), &["init", "-q", "--bare", &origin.to_string_lossy()])?;
        git(&repo, &["remote", "add", "origin", &origin.to_string_lossy()])?;
        git(&repo, &["push", "-q", "origin", "main"])?;

        Ok(Self {
            _temp: temp,
            repo,
            origin,
            worktrees,
        })
    }

    pub fn path(&self) -> &Path {
        &self.repo
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees
    }

    /// Commit a file on the checked-out branch of the main repository.
    pub fn commit_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.repo.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        git(&self.repo, &["add", rel])?;
        git(&self.repo, &["commit", "-q", "-m", &format!("add {rel}")])?;
        Ok(())
    }

    /// SHA of `branch` on the bare remote, if it was pushed.
    pub fn remote_branch_sha(&self, branch: &str) -> Option<String> {
        let reference = format!("refs/heads/{branch}");
        git(&self.origin, &["rev-parse", "--verify", "--quiet", &reference]).ok()
    }

    /// Config pointing at this repo's worktree root, with checks that pass and
    /// no lint step.
    pub fn config(&self) -> PatchgateConfig {
        let mut cfg = PatchgateConfig {
            worktrees_root: self.worktrees.clone(),
            allowed_prefixes: vec!["src/".to_string()],
            ..PatchgateConfig::default()
        };
        cfg.verify.test_command = vec!["true".to_string()];
        cfg.verify.lint_command = Vec::new();
        cfg.verify.timeout_secs = 30;
        cfg
    }
}

/// Run git in `dir` and return trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let argv = ["git"].into_iter().chain(args.iter().copied());
    let spec = CommandSpec::new(argv, dir, Duration::from_secs(30));
    let out = run(&spec, Mode::Strict)?;
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Proposer that returns a canned proposal, optionally after editing files in
/// the workspace directly.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    summary: String,
    patch: Option<Patch>,
    commit_message: Option<String>,
    title: Option<String>,
    direct_writes: Vec<(String, String)>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProposer {
    pub fn with_patch(patch: Patch) -> Self {
        Self {
            summary: "scripted change".to_string(),
            patch: Some(patch),
            ..Self::default()
        }
    }

    pub fn no_patch() -> Self {
        Self {
            summary: "nothing to do".to_string(),
            ..Self::default()
        }
    }

    pub fn failing(detail: &str) -> Self {
        Self {
            failure: Some(detail.to_string()),
            ..Self::default()
        }
    }

    /// Write `content` to `rel` in the workspace before answering.
    pub fn writes(mut self, rel: &str, content: &str) -> Self {
        self.direct_writes.push((rel.to_string(), content.to_string()));
        self
    }

    pub fn commit_message(mut self, message: &str) -> Self {
        self.commit_message = Some(message.to_string());
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Proposer for ScriptedProposer {
    fn propose(
        &self,
        request: &ProposalRequest,
        on_event: &mut dyn FnMut(&ProposerEvent),
    ) -> Result<Proposal, ProposerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_event(&ProposerEvent::Started {
            command: "scripted".to_string(),
        });
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(detail) = &self.failure {
            return Err(ProposerError::Unavailable {
                detail: detail.clone(),
            });
        }
        for (rel, content) in &self.direct_writes {
            let path = request.workspace.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ProposerError::InvalidResponse {
                    detail: e.to_string(),
                })?;
            }
            fs::write(&path, content).map_err(|e| ProposerError::InvalidResponse {
                detail: e.to_string(),
            })?;
        }
        on_event(&ProposerEvent::Finished { exit_code: Some(0) });
        Ok(Proposal {
            summary: self.summary.clone(),
            patch: self.patch.clone(),
            commit_message: self.commit_message.clone(),
            title: self.title.clone(),
        })
    }
}

/// Hosting client that records requests and answers with a fixed URL.
#[derive(Debug)]
pub struct RecordingHost {
    url: String,
    fail: bool,
    requests: Mutex<Vec<ReviewRequest>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self {
            url: "https://example.test/pulls/1".to_string(),
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn requests(&self) -> Vec<ReviewRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ReviewHost for RecordingHost {
    fn open_change_request(
        &self,
        request: &ReviewRequest,
        _workdir: &Path,
    ) -> Result<String, PublishError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.fail {
            return Err(PublishError::ChangeRequest {
                detail: "HTTP 422: a pull request already exists".to_string(),
            });
        }
        Ok(self.url.clone())
    }
}
