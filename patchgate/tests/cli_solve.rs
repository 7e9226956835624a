use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use patchgate::test_support::TestRepo;

fn patchgate() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_patchgate"));
    for key in [
        "PATCHGATE_BASE_BRANCH",
        "PATCHGATE_WORKTREES_DIR",
        "PATCHGATE_TEST_CMD",
        "PATCHGATE_LINT_CMD",
        "PATCHGATE_ALLOWED_PREFIXES",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Write a proposer script that drops `response` at the response path.
fn write_proposer(dir: &Path, response: &str) -> std::path::PathBuf {
    let script = dir.join("propose.sh");
    fs::write(
        &script,
        format!("cat > /dev/null\ncat > \"$PATCHGATE_RESPONSE_PATH\" <<'EOF'\n{response}\nEOF\n"),
    )
    .expect("write script");
    script
}

fn write_config(repo: &TestRepo, dir: &Path, script: &Path, test_command: &str) -> std::path::PathBuf {
    let config = dir.join("config.toml");
    fs::write(
        &config,
        format!(
            r#"worktrees_root = {worktrees:?}
allowed_prefixes = ["src/"]

[verify]
test_command = [{test_command}]
lint_command = []
timeout_secs = 30

[proposer]
command = ["sh", {script:?}]
timeout_secs = 30
"#,
            worktrees = repo.worktrees_root().display().to_string(),
            script = script.display().to_string(),
        ),
    )
    .expect("write config");
    config
}

#[test]
fn help_exits_zero_and_usage_errors_exit_one() {
    let help = patchgate().arg("--help").output().expect("run");
    assert_eq!(help.status.code(), Some(0));
    assert!(stdout(&help).contains("solve"));

    let bare = patchgate().output().expect("run");
    assert_eq!(bare.status.code(), Some(1));

    let conflict = patchgate()
        .args(["solve", "x", "--dry-run", "--apply"])
        .output()
        .expect("run");
    assert_eq!(conflict.status.code(), Some(1));
}

#[test]
fn branch_name_prints_normalized_text() {
    let out = patchgate()
        .args(["branch-name", "Fix", "Bug in", "LOGIN flow!"])
        .output()
        .expect("run");
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out).trim(), "fix-bug-in-login-flow");
}

#[test]
fn solve_outside_a_repository_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = patchgate()
        .arg("--repo")
        .arg(temp.path())
        .args(["solve", "anything"])
        .output()
        .expect("run");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn solve_dry_run_succeeds_with_scripted_agent() {
    let repo = TestRepo::new().expect("repo");
    let scratch = tempfile::tempdir().expect("tempdir");
    let script = write_proposer(
        scratch.path(),
        r#"{"summary": "add greeting", "patch": {"files": {"src/hello.txt": "hi\n"}}}"#,
    );
    let config = write_config(&repo, scratch.path(), &script, r#""true""#);

    let out = patchgate()
        .arg("--repo")
        .arg(repo.path())
        .arg("--config")
        .arg(&config)
        .args(["solve", "Fix bug in login flow", "--dry-run"])
        .output()
        .expect("run");

    let text = stdout(&out);
    assert_eq!(
        out.status.code(),
        Some(0),
        "{text}\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(text.contains("branch: issue-fix-bug-in-login-flow"), "{text}");
    assert!(text.contains("state:  Verified"), "{text}");
    assert!(text.contains("src/hello.txt"), "{text}");
    assert!(repo.remote_branch_sha("issue-fix-bug-in-login-flow").is_none());
}

#[test]
fn solve_with_failing_tests_exits_two() {
    let repo = TestRepo::new().expect("repo");
    let scratch = tempfile::tempdir().expect("tempdir");
    let script = write_proposer(
        scratch.path(),
        r#"{"summary": "s", "patch": {"files": {"src/a.txt": "a\n"}}}"#,
    );
    let config = write_config(&repo, scratch.path(), &script, r#""sh", "-c", "exit 1""#);

    let out = patchgate()
        .arg("--repo")
        .arg(repo.path())
        .arg("--config")
        .arg(&config)
        .args(["solve", "break", "it", "--apply", "--no-pr"])
        .output()
        .expect("run");

    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(2), "{text}");
    assert!(text.contains("state:  Failed(verify)"), "{text}");
    assert!(text.contains("workspace kept at"), "{text}");
    assert!(repo.remote_branch_sha("issue-break-it").is_none());
}

#[test]
fn tool_write_respects_allow_list_from_environment() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join("src")).expect("mkdir");
    fs::write(temp.path().join("src/a.txt"), "old").expect("seed");

    let ok = patchgate()
        .env("PATCHGATE_ALLOWED_PREFIXES", "src/")
        .args(["tool", "write", "--root"])
        .arg(temp.path())
        .args(["src/a.txt", "--content", "new"])
        .output()
        .expect("run");
    assert_eq!(ok.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_slice(&ok.stdout).expect("json");
    assert_eq!(json["path"], "src/a.txt");
    assert_eq!(json["backup"], "src/a.txt.bak");
    assert_eq!(fs::read_to_string(temp.path().join("src/a.txt")).expect("read"), "new");

    let denied = patchgate()
        .env("PATCHGATE_ALLOWED_PREFIXES", "src/")
        .args(["tool", "write", "--root"])
        .arg(temp.path())
        .args(["Makefile", "--content", "all:"])
        .output()
        .expect("run");
    assert_eq!(denied.status.code(), Some(1));
    assert!(!temp.path().join("Makefile").exists());
}

#[test]
fn tool_read_reports_missing_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = patchgate()
        .args(["tool", "read", "--root"])
        .arg(temp.path())
        .arg("nope.txt")
        .output()
        .expect("run");
    assert_eq!(out.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(json["status"], "not_found");
}
