//! Proposer boundary.
//!
//! The pipeline treats the change-proposing agent as opaque: it gets an
//! instruction and a workspace, may edit allowed files directly through the
//! tool surface, and answers with a summary and an optional patch.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::patch::Patch;
use crate::error::{ProcessError, ProposerError};
use crate::io::process::{CommandSpec, DEFAULT_OUTPUT_LIMIT_BYTES, Mode, run};

const PROPOSER_TEMPLATE: &str = include_str!("prompts/proposer.md");
const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");

pub const DEFAULT_PROPOSER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Environment variable naming the file the agent must write its response to.
pub const RESPONSE_PATH_ENV: &str = "PATCHGATE_RESPONSE_PATH";
pub const WORKSPACE_ENV: &str = "PATCHGATE_WORKSPACE";
/// Comma-separated allow-list, honoured by `patchgate tool write`.
pub const ALLOWED_PREFIXES_ENV: &str = "PATCHGATE_ALLOWED_PREFIXES";

pub const PROPOSER_LOG: &str = "proposer.log";
pub const PROPOSAL_FILE: &str = "proposal.json";

/// Input for one proposal.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub instruction: String,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub allowed_prefixes: Vec<String>,
    /// Where the proposer log and raw response are kept.
    #[serde(skip)]
    pub run_dir: PathBuf,
}

/// What the proposer hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub summary: String,
    #[serde(default)]
    pub patch: Option<Patch>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Progress reported while a proposal is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposerEvent {
    Started { command: String },
    Line(String),
    Finished { exit_code: Option<i32> },
}

/// The single capability the pipeline needs from a proposer backend.
pub trait Proposer {
    fn propose(
        &self,
        request: &ProposalRequest,
        on_event: &mut dyn FnMut(&ProposerEvent),
    ) -> Result<Proposal, ProposerError>;
}

/// Runs an external agent command inside the workspace.
///
/// The rendered prompt goes to stdin, stdout is streamed to `proposer.log`,
/// and the agent writes its JSON response to `$PATCHGATE_RESPONSE_PATH`.
/// Stdout lines are reported as [`ProposerEvent::Line`] once the agent exits.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandProposer {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

impl Proposer for CommandProposer {
    #[instrument(skip_all, fields(workspace = %request.workspace.display(), timeout_secs = self.timeout.as_secs()))]
    fn propose(
        &self,
        request: &ProposalRequest,
        on_event: &mut dyn FnMut(&ProposerEvent),
    ) -> Result<Proposal, ProposerError> {
        if self.command.is_empty() {
            return Err(ProposerError::Unavailable {
                detail: "no proposer command configured".to_string(),
            });
        }
        let prompt = render_prompt(request).map_err(|e| ProposerError::Unavailable {
            detail: format!("{e:#}"),
        })?;
        fs::create_dir_all(&request.run_dir).map_err(|e| ProposerError::Unavailable {
            detail: format!("create {}: {e}", request.run_dir.display()),
        })?;
        let response_path = request.run_dir.join(PROPOSAL_FILE);
        // A leftover response from an earlier attempt must not be mistaken for this one.
        let _ = fs::remove_file(&response_path);

        let spec = CommandSpec::new(self.command.iter().cloned(), &request.workspace, self.timeout)
            .stdin(prompt)
            .env(RESPONSE_PATH_ENV, response_path.to_string_lossy())
            .env(WORKSPACE_ENV, request.workspace.to_string_lossy())
            .env(ALLOWED_PREFIXES_ENV, request.allowed_prefixes.join(","))
            .output_limit(self.output_limit_bytes)
            .stream_to(request.run_dir.join(PROPOSER_LOG));
        on_event(&ProposerEvent::Started {
            command: spec.display(),
        });
        info!("starting proposer");

        let out = match run(&spec, Mode::Lenient) {
            Ok(out) => out,
            Err(ProcessError::Spawn { program, source }) => {
                return Err(ProposerError::Unavailable {
                    detail: format!("spawn {program}: {source}"),
                });
            }
            Err(e) => return Err(e.into()),
        };
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            on_event(&ProposerEvent::Line(line.to_string()));
        }
        on_event(&ProposerEvent::Finished {
            exit_code: out.exit_code(),
        });

        if out.timed_out {
            warn!("proposer timed out");
            return Err(ProcessError::TimedOut {
                command: out.command.clone(),
                timeout: self.timeout,
                stdout: out.stdout_str(),
                stderr: out.stderr_str(),
            }
            .into());
        }
        if !out.status.success() {
            warn!(exit_code = ?out.exit_code(), "proposer failed");
            return Err(ProcessError::Failed {
                command: out.command.clone(),
                exit_code: out.exit_code(),
                stdout: out.stdout_str(),
                stderr: out.stderr_str(),
            }
            .into());
        }

        let raw = match fs::read_to_string(&response_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProposerError::MissingResponse {
                    path: response_path,
                });
            }
            Err(e) => {
                return Err(ProposerError::InvalidResponse {
                    detail: format!("read {}: {e}", response_path.display()),
                });
            }
        };
        let proposal = parse_response(&raw)?;
        debug!(has_patch = proposal.patch.is_some(), "proposal parsed");
        Ok(proposal)
    }
}

/// Render the agent prompt, with the request appended as JSON.
pub fn render_prompt(request: &ProposalRequest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("proposer", PROPOSER_TEMPLATE)
        .context("load proposer template")?;
    let request_json = serde_json::to_string_pretty(request).context("serialize request")?;
    let rendered = env.get_template("proposer")?.render(context! {
        workspace => request.workspace.display().to_string(),
        instruction => request.instruction.trim(),
        dry_run => request.dry_run,
        allowed_prefixes => &request.allowed_prefixes,
        request_json => request_json,
    })?;
    Ok(rendered)
}

/// Parse and schema-check a raw proposer response.
pub fn parse_response(raw: &str) -> Result<Proposal, ProposerError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProposerError::InvalidResponse {
        detail: format!("not JSON: {e}"),
    })?;
    validate_response(&value).map_err(|e| ProposerError::InvalidResponse {
        detail: format!("{e:#}"),
    })?;
    serde_json::from_value(value).map_err(|e| ProposerError::InvalidResponse {
        detail: e.to_string(),
    })
}

fn validate_response(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
    let compiled =
        jsonschema::validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("schema validation failed: {}", messages.join("; ")));
    }
    Ok(())
}

/// Save the proposal in the run directory when the proposer did not write one there.
pub fn write_proposal(run_dir: &Path, proposal: &Proposal) -> Result<PathBuf> {
    fs::create_dir_all(run_dir).with_context(|| format!("create {}", run_dir.display()))?;
    let path = run_dir.join(PROPOSAL_FILE);
    let mut buf = serde_json::to_string_pretty(proposal)?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
