//! Verification gate: test and lint commands run inside the workspace.
//!
//! A failing command is a result, not an error. Whether it aborts the run is
//! the orchestrator's decision.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{CheckResult, VerifyResult};
use crate::io::process::{CommandSpec, DEFAULT_OUTPUT_LIMIT_BYTES, Mode, run};

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(600);

pub const TEST_LABEL: &str = "test";
pub const LINT_LABEL: &str = "lint";

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    /// `None` or an empty argv skips the test step.
    pub test_command: Option<Vec<String>>,
    /// `None` or an empty argv skips the lint step.
    pub lint_command: Option<Vec<String>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// When set, each check's output is also written to `<label>.log` here.
    pub log_dir: Option<PathBuf>,
}

impl VerifyRequest {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            test_command: None,
            lint_command: None,
            timeout: DEFAULT_VERIFY_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            log_dir: None,
        }
    }
}

/// Runs one verification command and classifies it.
pub trait CheckRunner {
    fn run_check(
        &self,
        label: &str,
        argv: &[String],
        workdir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> CheckResult;
}

/// Runs checks as child processes through the command runner.
pub struct ProcessCheckRunner;

impl CheckRunner for ProcessCheckRunner {
    fn run_check(
        &self,
        label: &str,
        argv: &[String],
        workdir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> CheckResult {
        let spec = CommandSpec::new(argv.iter().cloned(), workdir, timeout)
            .output_limit(output_limit_bytes);
        match run(&spec, Mode::Lenient) {
            Ok(out) => CheckResult {
                label: label.to_string(),
                command: argv.to_vec(),
                passed: out.success(),
                exit_code: if out.timed_out { None } else { out.exit_code() },
                stdout: out.stdout_str(),
                stderr: out.stderr_str(),
                timed_out: out.timed_out,
                error: None,
            },
            Err(e) => CheckResult {
                label: label.to_string(),
                command: argv.to_vec(),
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: e.stderr().unwrap_or_default().to_string(),
                timed_out: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Run the test command then the lint command. Lint runs even when tests fail
/// so the report shows both.
#[instrument(skip_all, fields(workdir = %request.workdir.display()))]
pub fn verify<R: CheckRunner>(runner: &R, request: &VerifyRequest) -> VerifyResult {
    let test = run_one(runner, TEST_LABEL, request.test_command.as_deref(), request);
    let lint = run_one(runner, LINT_LABEL, request.lint_command.as_deref(), request);
    let result = VerifyResult { test, lint };
    info!(passed = result.passed(), "verification finished");
    result
}

fn run_one<R: CheckRunner>(
    runner: &R,
    label: &str,
    argv: Option<&[String]>,
    request: &VerifyRequest,
) -> Option<CheckResult> {
    let argv = argv.filter(|argv| !argv.is_empty())?;
    let check = runner.run_check(
        label,
        argv,
        &request.workdir,
        request.timeout,
        request.output_limit_bytes,
    );
    if !check.passed {
        warn!(label, outcome = ?check.outcome(), exit_code = ?check.exit_code, "check did not pass");
    }
    if let Some(dir) = &request.log_dir
        && let Err(e) = write_check_log(&dir.join(format!("{label}.log")), &check)
    {
        warn!(err = %e, label, "failed to write check log");
    }
    Some(check)
}

fn write_check_log(path: &Path, check: &CheckResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create check log dir {}", parent.display()))?;
    }
    let mut buf = format!(
        "$ {}\n=== outcome: {:?} exit_code: {:?} ===\n",
        shell_words::join(&check.command),
        check.outcome(),
        check.exit_code
    );
    if let Some(error) = &check.error {
        buf.push_str(error);
        buf.push('\n');
    }
    buf.push_str("=== stdout ===\n");
    buf.push_str(&check.stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&check.stderr);
    fs::write(path, buf).with_context(|| format!("write check log {}", path.display()))
}
