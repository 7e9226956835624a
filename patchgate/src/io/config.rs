//! Pipeline configuration stored under `.patchgate/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::lock::LockPolicy;
use crate::io::workspace::{ExistingPolicy, KeepPolicy};

pub const CONFIG_RELATIVE_PATH: &str = ".patchgate/config.toml";

pub const ENV_BASE_BRANCH: &str = "PATCHGATE_BASE_BRANCH";
pub const ENV_WORKTREES_DIR: &str = "PATCHGATE_WORKTREES_DIR";
pub const ENV_TEST_CMD: &str = "PATCHGATE_TEST_CMD";
pub const ENV_LINT_CMD: &str = "PATCHGATE_LINT_CMD";

/// Pipeline configuration (TOML).
///
/// Missing fields take their defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchgateConfig {
    /// Branch change requests are opened against.
    pub base_branch: String,
    /// Remote the work branch is pushed to.
    pub remote: String,
    /// Parent directory for worktrees and run artifacts.
    pub worktrees_root: PathBuf,
    /// Path prefixes a patch may touch.
    pub allowed_prefixes: Vec<String>,
    pub git_timeout_secs: u64,
    /// Per-stream cap on captured process output.
    pub output_limit_bytes: usize,
    pub workspace: WorkspaceConfig,
    pub verify: VerifyConfig,
    pub proposer: ProposerConfig,
    pub hosting: HostingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub on_existing: ExistingPolicy,
    pub keep: KeepPolicy,
    pub lock: LockPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Empty to skip tests.
    pub test_command: Vec<String>,
    /// Empty to skip lint.
    pub lint_command: Vec<String>,
    pub timeout_secs: u64,
    /// A failing check fails the run. Otherwise it is only reported.
    pub mandatory: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            test_command: strings(&["pytest", "-q"]),
            lint_command: strings(&["flake8", "--max-line-length=120"]),
            timeout_secs: 600,
            mandatory: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Agent argv. Receives the prompt on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: strings(&["codex-agent"]),
            timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostingConfig {
    /// Argv prefix for the hosting CLI, e.g. `["gh"]`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            command: strings(&["gh"]),
            timeout_secs: 120,
        }
    }
}

impl Default for PatchgateConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            worktrees_root: PathBuf::from("/tmp/patchgate-worktrees"),
            allowed_prefixes: strings(&[
                "src/",
                "app/",
                "tests/",
                "requirements.txt",
                "pyproject.toml",
                "package.json",
                "Cargo.toml",
            ]),
            git_timeout_secs: 120,
            output_limit_bytes: 1_000_000,
            workspace: WorkspaceConfig::default(),
            verify: VerifyConfig::default(),
            proposer: ProposerConfig::default(),
            hosting: HostingConfig::default(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PatchgateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must not be empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must not be empty"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.proposer.timeout_secs == 0 {
            return Err(anyhow!("proposer.timeout_secs must be > 0"));
        }
        if self.hosting.timeout_secs == 0 {
            return Err(anyhow!("hosting.timeout_secs must be > 0"));
        }
        if !self.allowed_prefixes.iter().any(|p| !p.trim().is_empty()) {
            return Err(anyhow!("allowed_prefixes must contain at least one prefix"));
        }
        if self.proposer.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("proposer.command must be a non-empty array"));
        }
        if self.hosting.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("hosting.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Apply `PATCHGATE_*` overrides read through `lookup`.
    ///
    /// Command overrides are split like a shell would split them but are
    /// never run through one.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup(ENV_BASE_BRANCH).filter(|v| !v.trim().is_empty()) {
            self.base_branch = base.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_WORKTREES_DIR).filter(|v| !v.trim().is_empty()) {
            self.worktrees_root = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup(ENV_TEST_CMD) {
            self.verify.test_command =
                shell_words::split(&cmd).with_context(|| format!("parse {ENV_TEST_CMD}"))?;
        }
        if let Some(cmd) = lookup(ENV_LINT_CMD) {
            self.verify.lint_command =
                shell_words::split(&cmd).with_context(|| format!("parse {ENV_LINT_CMD}"))?;
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify.timeout_secs)
    }

    pub fn proposer_timeout(&self) -> Duration {
        Duration::from_secs(self.proposer.timeout_secs)
    }

    pub fn hosting_timeout(&self) -> Duration {
        Duration::from_secs(self.hosting.timeout_secs)
    }
}

/// Default config location for a repository.
pub fn config_path(repo: &Path) -> PathBuf {
    repo.join(CONFIG_RELATIVE_PATH)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PatchgateConfig::default()`.
pub fn load_config(path: &Path) -> Result<PatchgateConfig> {
    if !path.exists() {
        let cfg = PatchgateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PatchgateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config, then apply environment overrides and re-validate.
pub fn load_with_env(path: &Path) -> Result<PatchgateConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PatchgateConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
base_branch = "develop"
allowed_prefixes = ["lib/"]

[workspace]
on_existing = "reuse"
lock = "wait"

[verify]
test_command = ["cargo", "test"]
mandatory = false
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.base_branch, "develop");
        assert_eq!(cfg.allowed_prefixes, vec!["lib/".to_string()]);
        assert_eq!(cfg.workspace.on_existing, ExistingPolicy::Reuse);
        assert_eq!(cfg.workspace.lock, LockPolicy::Wait);
        assert_eq!(cfg.workspace.keep, KeepPolicy::OnFailure);
        assert_eq!(cfg.verify.test_command, vec!["cargo", "test"]);
        assert_eq!(cfg.verify.lint_command, VerifyConfig::default().lint_command);
        assert!(!cfg.verify.mandatory);
        assert_eq!(cfg.remote, "origin");
    }

    #[test]
    fn rejects_invalid_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        for bad in [
            "git_timeout_secs = 0",
            "allowed_prefixes = []",
            "[proposer]\ncommand = []",
            "[workspace]\non_existing = \"explode\"",
        ] {
            fs::write(&path, bad).expect("write");
            assert!(load_config(&path).is_err(), "{bad}");
        }
    }

    #[test]
    fn env_overrides_split_commands_without_a_shell() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BASE_BRANCH, "release"),
            (ENV_WORKTREES_DIR, "/var/tmp/wt"),
            (ENV_TEST_CMD, "sh -c 'exit 1'"),
            (ENV_LINT_CMD, ""),
        ]);
        let mut cfg = PatchgateConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");

        assert_eq!(cfg.base_branch, "release");
        assert_eq!(cfg.worktrees_root, PathBuf::from("/var/tmp/wt"));
        assert_eq!(cfg.verify.test_command, vec!["sh", "-c", "exit 1"]);
        assert!(cfg.verify.lint_command.is_empty());
    }

    #[test]
    fn unbalanced_quotes_in_override_are_rejected() {
        let mut cfg = PatchgateConfig::default();
        let err = cfg
            .apply_env_overrides(|key| (key == ENV_TEST_CMD).then(|| "pytest 'oops".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_TEST_CMD));
    }
}
