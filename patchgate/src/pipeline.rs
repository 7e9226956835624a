//! Pipeline orchestrator.
//!
//! Runs each stage exactly once, in order, and is the only place a stage error
//! becomes a terminal [`PipelineState::Failed`]. The branch lock is held from
//! before the workspace is created until after it is cleaned up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::core::branch::{BranchName, derive_branch};
use crate::core::patch::{Patch, PatchKind, summarize_diff};
use crate::core::state::{PipelineState, RunTrace, Stage, StageRecord};
use crate::core::types::{ApplyResult, ChangeRequest, RunMode, VerifyResult};
use crate::core::validator::{validate, validate_paths};
use crate::error::{ProcessError, ValidationError, WorkspaceError};
use crate::io::apply::{Applicator, is_backup_entry};
use crate::io::config::PatchgateConfig;
use crate::io::git::Git;
use crate::io::lock::BranchLocks;
use crate::io::proposer::{Proposal, ProposalRequest, Proposer, ProposerEvent, write_proposal};
use crate::io::publish::{PublishOutcome, Publisher, ReviewHost, ReviewRequest};
use crate::io::run_log::{RunPaths, generate_run_id, write_json};
use crate::io::verify::{ProcessCheckRunner, VerifyRequest, verify};
use crate::io::workspace::{Workspace, WorkspaceManager};

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Shared flag, for signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub mode: RunMode,
    pub run_tests: bool,
    pub open_pr: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::DryRun,
            run_tests: true,
            open_pr: true,
        }
    }
}

/// Everything a run produced. Written to `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub instruction: String,
    pub branch: BranchName,
    pub state: PipelineState,
    pub trace: Vec<StageRecord>,
    pub workspace: Option<PathBuf>,
    pub workspace_kept: bool,
    /// Files changed in the workspace before publishing.
    pub changed_files: Vec<String>,
    pub run_dir: PathBuf,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state.is_success(self.mode)
    }

    pub fn verify_result(&self) -> Option<&VerifyResult> {
        self.trace.iter().find_map(|record| match record {
            StageRecord::Verify(result) => Some(result),
            _ => None,
        })
    }

    pub fn pr_url(&self) -> Option<&str> {
        self.trace.iter().find_map(|record| match record {
            StageRecord::Publish(result) => result.pr_url.as_deref(),
            _ => None,
        })
    }

    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run:    {}\n", self.run_id));
        out.push_str(&format!("branch: {}\n", self.branch));
        out.push_str(&format!("state:  {}\n", self.state));
        if let PipelineState::Failed { stage, reason } = &self.state {
            out.push_str(&format!("stage:  {}\n", stage.as_str()));
            out.push_str(&format!("reason: {reason}\n"));
        }
        if let Some(url) = self.pr_url() {
            out.push_str(&format!("pr:     {url}\n"));
        }
        if !self.changed_files.is_empty() {
            out.push_str("changed:\n");
            for file in &self.changed_files {
                out.push_str(&format!("  {file}\n"));
            }
        }
        if let Some(result) = self.verify_result() {
            for check in result.failed_checks() {
                out.push_str(&format!(
                    "--- {} ({:?}, exit code {:?}): {}\n",
                    check.label,
                    check.outcome(),
                    check.exit_code,
                    shell_words::join(&check.command)
                ));
                if let Some(error) = &check.error {
                    out.push_str(&format!("{error}\n"));
                }
                out.push_str(&format!("=== stdout ===\n{}\n", check.stdout));
                out.push_str(&format!("=== stderr ===\n{}\n", check.stderr));
            }
        }
        if let Some(path) = self.workspace.as_ref().filter(|_| self.workspace_kept) {
            out.push_str(&format!("workspace kept at {}\n", path.display()));
        }
        out.push_str(&format!("report: {}\n", self.run_dir.display()));
        out
    }
}

/// Mutable state of one run, owned by [`Pipeline::run`].
struct RunContext {
    trace: RunTrace,
    paths: RunPaths,
    workspace: Option<Workspace>,
    changed_files: Vec<String>,
}

impl RunContext {
    fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(stage = stage.as_str(), %reason, "stage failed");
        self.trace.fail(stage, reason);
    }
}

pub struct Pipeline<'a, P: Proposer, H: ReviewHost> {
    config: &'a PatchgateConfig,
    repo: PathBuf,
    proposer: &'a P,
    host: &'a H,
    locks: BranchLocks,
    cancel: CancelToken,
}

impl<'a, P: Proposer, H: ReviewHost> Pipeline<'a, P, H> {
    pub fn new(
        config: &'a PatchgateConfig,
        repo: impl Into<PathBuf>,
        proposer: &'a P,
        host: &'a H,
    ) -> Self {
        Self {
            config,
            repo: repo.into(),
            proposer,
            host,
            locks: BranchLocks::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Share per-branch locks with other pipelines in this process.
    pub fn with_locks(mut self, locks: BranchLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(&self.repo, &self.config.worktrees_root)
            .on_existing(self.config.workspace.on_existing)
            .git_timeout(self.config.git_timeout())
    }

    /// Run the whole pipeline for one change request.
    pub fn run(&self, request: &ChangeRequest, options: &PipelineOptions) -> RunReport {
        let run_id = generate_run_id();
        let branch = derive_branch(
            &request.raw_instruction,
            request.requested_branch.as_deref(),
        );
        let span = info_span!("pipeline", run_id = %run_id, branch = %branch, mode = ?options.mode);
        let _enter = span.enter();
        info!("run started");

        let mut ctx = RunContext {
            trace: RunTrace::new(options.mode),
            paths: RunPaths::new(&self.config.worktrees_root, &branch, &run_id),
            workspace: None,
            changed_files: Vec::new(),
        };
        ctx.trace.record(StageRecord::Branch {
            branch: branch.clone(),
        });

        if branch.is_empty() {
            let err = WorkspaceError::InvalidBranch {
                input: request
                    .requested_branch
                    .clone()
                    .unwrap_or_else(|| request.raw_instruction.clone()),
            };
            ctx.fail(Stage::Workspace, err.to_string());
        } else if !self.check_cancel(&mut ctx, "workspace") {
            match self.locks.acquire(
                &branch,
                &self.config.worktrees_root,
                self.config.workspace.lock,
            ) {
                Ok(_guard) => {
                    self.drive(&mut ctx, &branch, request, options);
                    self.cleanup(&mut ctx);
                }
                Err(e) => ctx.fail(Stage::Workspace, e.to_string()),
            }
        }

        let workspace_kept = ctx
            .workspace
            .as_ref()
            .is_some_and(|ws| ws.path.exists());
        let (state, trace) = ctx.trace.into_parts();
        let report = RunReport {
            run_id,
            mode: options.mode,
            instruction: request.raw_instruction.clone(),
            branch,
            state,
            trace,
            workspace: ctx.workspace.map(|ws| ws.path),
            workspace_kept,
            changed_files: ctx.changed_files,
            run_dir: ctx.paths.dir.clone(),
        };
        if let Err(e) = write_json(&ctx.paths.report, &report) {
            warn!(err = %format!("{e:#}"), "failed to write run report");
        }
        info!(state = %report.state, "run finished");
        report
    }

    fn check_cancel(&self, ctx: &mut RunContext, next: &str) -> bool {
        if self.cancel.is_cancelled() {
            ctx.fail(Stage::Cancelled, format!("cancelled before {next}"));
            return true;
        }
        false
    }

    fn drive(
        &self,
        ctx: &mut RunContext,
        branch: &BranchName,
        request: &ChangeRequest,
        options: &PipelineOptions,
    ) {
        let Some(ws) = self.stage_workspace(ctx, branch) else {
            return;
        };
        if self.check_cancel(ctx, "proposal") {
            return;
        }
        let Some((proposal, patch)) = self.stage_propose(ctx, &ws, request, options) else {
            return;
        };
        if self.check_cancel(ctx, "validation") {
            return;
        }
        if !self.stage_validate(ctx, &ws, &patch) {
            return;
        }
        if self.check_cancel(ctx, "apply") {
            return;
        }
        let Some(applied) = self.stage_apply(ctx, &ws, &patch) else {
            return;
        };
        if self.check_cancel(ctx, "verify") {
            return;
        }
        let Some(verified) = self.stage_verify(ctx, &ws, options) else {
            return;
        };
        ctx.changed_files = changed_files(&ws, self.config);
        if options.mode == RunMode::DryRun {
            info!("dry run complete");
            return;
        }
        if self.check_cancel(ctx, "publish") {
            return;
        }
        self.stage_publish(ctx, &ws, request, options, &proposal, &applied, &verified);
    }

    fn stage_workspace(&self, ctx: &mut RunContext, branch: &BranchName) -> Option<Workspace> {
        match self.workspaces().create(branch) {
            Ok(created) => {
                ctx.trace.record(StageRecord::Workspace {
                    path: created.workspace.path.display().to_string(),
                    reused: created.reused,
                });
                ctx.workspace = Some(created.workspace.clone());
                ctx.trace.advance(PipelineState::WorkspaceReady);
                Some(created.workspace)
            }
            Err(e) => {
                ctx.fail(Stage::Workspace, e.to_string());
                None
            }
        }
    }

    fn stage_propose(
        &self,
        ctx: &mut RunContext,
        ws: &Workspace,
        request: &ChangeRequest,
        options: &PipelineOptions,
    ) -> Option<(Proposal, Patch)> {
        let proposal_request = ProposalRequest {
            instruction: request.raw_instruction.clone(),
            workspace: ws.path.clone(),
            dry_run: options.mode == RunMode::DryRun,
            allowed_prefixes: self.config.allowed_prefixes.clone(),
            run_dir: ctx.paths.dir.clone(),
        };
        let mut on_event = |event: &ProposerEvent| match event {
            ProposerEvent::Started { command } => info!(%command, "proposer started"),
            ProposerEvent::Line(line) => debug!(%line, "proposer"),
            ProposerEvent::Finished { exit_code } => info!(?exit_code, "proposer finished"),
        };
        let proposal = match self.proposer.propose(&proposal_request, &mut on_event) {
            Ok(proposal) => proposal,
            Err(e) => {
                ctx.fail(Stage::Proposal, e.to_string());
                return None;
            }
        };
        if !ctx.paths.proposal.exists()
            && let Err(e) = write_proposal(&ctx.paths.dir, &proposal)
        {
            warn!(err = %format!("{e:#}"), "failed to save proposal");
        }

        let direct_edits = match workspace_edits(ws, self.config) {
            Ok(edits) => edits,
            Err(e) => {
                ctx.fail(Stage::Proposal, format!("inspect workspace: {e}"));
                return None;
            }
        };
        let patch = match proposal.patch.clone().filter(|p| !p.is_empty()) {
            Some(patch) => patch,
            None if !direct_edits.is_empty() => Patch::Files(Default::default()),
            None if options.mode == RunMode::Apply => {
                ctx.trace.record(proposal_record(&proposal, None, &direct_edits));
                ctx.fail(
                    Stage::NoChange,
                    "proposer returned no patch and changed no files",
                );
                return None;
            }
            None => {
                info!("no change proposed, continuing dry run as a no-op");
                Patch::Files(Default::default())
            }
        };

        info!(patch = %describe_patch(&patch), direct_edits = direct_edits.len(), "change proposed");
        ctx.trace
            .record(proposal_record(&proposal, Some(&patch), &direct_edits));
        ctx.trace.advance(PipelineState::PatchProposed);
        Some((proposal, patch))
    }

    fn stage_validate(&self, ctx: &mut RunContext, ws: &Workspace, patch: &Patch) -> bool {
        let allowed = &self.config.allowed_prefixes;
        // Direct edits were listed while proposing. List again so nothing
        // written since slips past.
        let drift = match workspace_edits(ws, self.config) {
            Ok(edits) => validate_paths(edits, allowed).rejected_paths,
            Err(e) => {
                ctx.fail(Stage::Validation, format!("inspect workspace: {e}"));
                return false;
            }
        };
        let result = validate(patch, allowed).merge_rejected(drift);
        ctx.trace.record(StageRecord::Validation(result.clone()));
        if !result.accepted {
            let err = ValidationError::Rejected {
                rejected_paths: result.rejected_paths,
            };
            ctx.fail(Stage::Validation, err.to_string());
            return false;
        }
        ctx.trace.advance(PipelineState::PatchValidated);
        true
    }

    fn stage_apply(
        &self,
        ctx: &mut RunContext,
        ws: &Workspace,
        patch: &Patch,
    ) -> Option<ApplyResult> {
        match Applicator::new(self.config.git_timeout()).apply(patch, ws) {
            Ok(result) => {
                ctx.trace.record(StageRecord::Apply(result.clone()));
                ctx.trace.advance(PipelineState::PatchApplied);
                Some(result)
            }
            Err(e) => {
                ctx.trace
                    .record(StageRecord::Apply(ApplyResult::failed(e.to_string(), Vec::new())));
                ctx.fail(Stage::Apply, e.to_string());
                None
            }
        }
    }

    fn stage_verify(
        &self,
        ctx: &mut RunContext,
        ws: &Workspace,
        options: &PipelineOptions,
    ) -> Option<VerifyResult> {
        let verify_cfg = &self.config.verify;
        let request = VerifyRequest {
            workdir: ws.path.clone(),
            test_command: options.run_tests.then(|| verify_cfg.test_command.clone()),
            lint_command: Some(verify_cfg.lint_command.clone()),
            timeout: self.config.verify_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
            log_dir: Some(ctx.paths.checks_dir.clone()),
        };
        let result = verify(&ProcessCheckRunner, &request);
        ctx.trace.record(StageRecord::Verify(result.clone()));

        let failures = result.failures();
        if !failures.is_empty() {
            let reason = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            if verify_cfg.mandatory {
                ctx.fail(Stage::Verify, reason);
                return None;
            }
            warn!(%reason, "verification failed but is not mandatory");
        }
        ctx.trace.advance(PipelineState::Verified);
        Some(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_publish(
        &self,
        ctx: &mut RunContext,
        ws: &Workspace,
        request: &ChangeRequest,
        options: &PipelineOptions,
        proposal: &Proposal,
        applied: &ApplyResult,
        verified: &VerifyResult,
    ) {
        let headline = request.headline();
        let message = proposal
            .commit_message
            .clone()
            .unwrap_or_else(|| headline.clone());
        let publisher = Publisher::new(&self.config.remote).git_timeout(self.config.git_timeout());
        let mut result = match publisher.commit_and_push(&message, ws, &applied.backups) {
            Ok(PublishOutcome::Pushed(result)) => result,
            Ok(PublishOutcome::NoChanges) => {
                ctx.fail(Stage::NoChange, "nothing to commit");
                return;
            }
            Err(e) => {
                ctx.fail(Stage::Publish, e.to_string());
                return;
            }
        };

        if options.open_pr {
            let review = ReviewRequest {
                base: self.config.base_branch.clone(),
                head: result.branch.to_string(),
                title: proposal.title.clone().unwrap_or(headline),
                body: pr_body(proposal, verified),
            };
            match self.host.open_change_request(&review, &ws.path) {
                Ok(url) => result.pr_url = Some(url),
                Err(e) => {
                    ctx.trace.record(StageRecord::Publish(result));
                    ctx.fail(Stage::Publish, e.to_string());
                    return;
                }
            }
        }
        ctx.trace.record(StageRecord::Publish(result));
        ctx.trace.advance(PipelineState::Published);
    }

    /// Destroy or keep the workspace according to policy. Cancelled runs are
    /// always cleaned up.
    fn cleanup(&self, ctx: &mut RunContext) {
        let Some(ws) = ctx.workspace.clone() else {
            return;
        };
        let state = ctx.trace.state();
        let cancelled = matches!(
            state,
            PipelineState::Failed {
                stage: Stage::Cancelled,
                ..
            }
        );
        if !cancelled && self.config.workspace.keep.keeps(state.is_failed()) {
            info!(path = %ws.path.display(), "keeping workspace");
            return;
        }
        let destroyed = match self.workspaces().destroy(&ws) {
            Ok(destroyed) => destroyed,
            Err(e) => {
                warn!(err = %e, path = %ws.path.display(), "failed to destroy workspace");
                false
            }
        };
        ctx.trace.record(StageRecord::Cleanup {
            path: ws.path.display().to_string(),
            destroyed,
        });
    }
}

fn proposal_record(
    proposal: &Proposal,
    patch: Option<&Patch>,
    direct_edits: &[String],
) -> StageRecord {
    StageRecord::Proposal {
        summary: proposal.summary.clone(),
        patch_kind: patch.map(Patch::kind),
        diff_summary: match patch {
            Some(Patch::Diff(text)) => Some(summarize_diff(text)),
            _ => None,
        },
        direct_edits: direct_edits.to_vec(),
    }
}

/// Paths changed in the workspace relative to HEAD, backups excluded.
fn workspace_edits(
    ws: &Workspace,
    config: &PatchgateConfig,
) -> Result<Vec<String>, ProcessError> {
    let entries = Git::new(&ws.path)
        .with_timeout(config.git_timeout())
        .status_porcelain()?;
    Ok(entries
        .into_iter()
        .filter(|entry| !is_backup_entry(&ws.path, entry))
        .map(|entry| entry.path)
        .collect())
}

fn changed_files(ws: &Workspace, config: &PatchgateConfig) -> Vec<String> {
    workspace_edits(ws, config).unwrap_or_else(|e| {
        warn!(err = %e, "failed to list changed files");
        Vec::new()
    })
}

fn pr_body(proposal: &Proposal, verified: &VerifyResult) -> String {
    let mut body = proposal.summary.trim().to_string();
    body.push_str("\n\n## Verification\n");
    for (label, check) in [("tests", &verified.test), ("lint", &verified.lint)] {
        let line = match check {
            Some(check) => format!("- {label}: {:?}\n", check.outcome()).to_lowercase(),
            None => format!("- {label}: skipped\n"),
        };
        body.push_str(&line);
    }
    body
}

/// Patch shape for logging, without the content.
fn describe_patch(patch: &Patch) -> String {
    match patch.kind() {
        PatchKind::Diff => format!("diff touching {} file(s)", patch.touched_paths().len()),
        PatchKind::Files => format!("{} file(s) by content", patch.touched_paths().len()),
    }
}

/// Source repository root containing `start`, via `git rev-parse`.
pub fn repository_root(start: &Path) -> Result<PathBuf, WorkspaceError> {
    let git = Git::new(start);
    if !git.is_repository()? {
        return Err(WorkspaceError::NotARepository {
            path: start.to_path_buf(),
            detail: "not inside a git work tree".to_string(),
        });
    }
    Ok(PathBuf::from(git.toplevel()?))
}
