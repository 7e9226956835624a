//! Run identity and artifact layout under `<worktrees_root>/runs/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::core::branch::BranchName;
use crate::io::proposer::{PROPOSAL_FILE, PROPOSER_LOG};

pub const REPORT_FILE: &str = "report.json";

/// `YYYYMMDD_HHMMSS_<6 lowercase alnum>`.
pub fn generate_run_id() -> String {
    format!("{}_{}", generate_timestamp(), generate_short_id())
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Where one run keeps its artifacts. Outside the worktree, so nothing here
/// can be committed.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub proposer_log: PathBuf,
    pub proposal: PathBuf,
    pub report: PathBuf,
    /// Verification logs (`test.log`, `lint.log`).
    pub checks_dir: PathBuf,
}

impl RunPaths {
    pub fn new(worktrees_root: &Path, branch: &BranchName, run_id: &str) -> Self {
        let dir = worktrees_root
            .join("runs")
            .join(branch.as_str())
            .join(run_id);
        Self {
            proposer_log: dir.join(PROPOSER_LOG),
            proposal: dir.join(PROPOSAL_FILE),
            report: dir.join(REPORT_FILE),
            checks_dir: dir.join("checks"),
            dir,
        }
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
