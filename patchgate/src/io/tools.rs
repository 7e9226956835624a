//! Tool surface offered to the proposer: read, write, diff, list, search.
//!
//! Every path is workspace-relative and resolved under a root; nothing here
//! can reach outside it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::validator::is_allowed;
use crate::error::ProcessError;
use crate::io::apply::{resolve_within, write_with_backup};
use crate::io::process::{CommandSpec, Mode, run};

/// Files up to this size are returned whole.
pub const READ_FULL_LIMIT_BYTES: u64 = 200 * 1024;
/// Larger files are cut to this many lines.
pub const READ_PREVIEW_LINES: usize = 500;
pub const DEFAULT_SEARCH_MAX: usize = 200;

const SKIPPED_EXTENSIONS: &[&str] = &["pyc", "bin", "o"];
const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadOutcome {
    Ok {
        path: String,
        content: String,
        truncated: bool,
        bytes: u64,
    },
    NotFound {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes: usize,
    pub backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    resolve_within(root, rel).ok_or_else(|| anyhow!("path escapes the workspace: {rel}"))
}

#[instrument(skip_all, fields(path = rel))]
pub fn read(root: &Path, rel: &str) -> Result<ReadOutcome> {
    let path = resolve(root, rel)?;
    let meta = match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(anyhow!("{rel} is not a file")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ReadOutcome::NotFound {
                path: rel.to_string(),
            });
        }
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&raw);
    let (content, truncated) = if meta.len() <= READ_FULL_LIMIT_BYTES {
        (text.into_owned(), false)
    } else {
        let preview: Vec<&str> = text.lines().take(READ_PREVIEW_LINES).collect();
        (preview.join("\n"), true)
    };
    Ok(ReadOutcome::Ok {
        path: rel.to_string(),
        content,
        truncated,
        bytes: meta.len(),
    })
}

/// Write a file inside the allow-list, keeping a `.bak` of any prior content
/// when `backup` is set.
#[instrument(skip_all, fields(path = rel, backup))]
pub fn write(
    root: &Path,
    rel: &str,
    content: &str,
    allowed_prefixes: &[String],
    backup: bool,
) -> Result<WriteOutcome> {
    if !is_allowed(rel, allowed_prefixes) {
        return Err(anyhow!("path not in allow-list: {rel}"));
    }
    let backup = write_with_backup(root, rel, content, backup)?;
    Ok(WriteOutcome {
        path: rel.to_string(),
        bytes: content.len(),
        backup,
    })
}

/// Unified diff from `a/<name>` to `b/<name>`. Empty when the contents match.
pub fn diff(name: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&format!("a/{name}"), &format!("b/{name}"))
        .to_string()
}

/// Every file under `root/subdir`, relative to `root`, sorted.
///
/// `.git` is skipped, as are compiled artifacts.
pub fn list(root: &Path, subdir: Option<&str>) -> Result<Vec<String>> {
    let start = match subdir {
        Some(sub) if !sub.is_empty() && sub != "." => resolve(root, sub)?,
        _ => root.to_path_buf(),
    };
    let mut files = Vec::new();
    for entry in WalkDir::new(&start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.with_context(|| format!("walk {}", start.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let skipped = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SKIPPED_EXTENSIONS.contains(&ext));
        if skipped {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    Ok(files)
}

/// Search file contents for `pattern`, capped at `max` matches.
///
/// Uses ripgrep when it is installed, otherwise a line-by-line regex scan.
#[instrument(skip_all, fields(pattern, max))]
pub fn search(root: &Path, pattern: &str, max: usize) -> Result<Vec<SearchMatch>> {
    match search_with_rg(root, pattern, max) {
        Ok(Some(matches)) => Ok(matches),
        Ok(None) => {
            debug!("rg unavailable, falling back to regex scan");
            scan_with_regex(root, pattern, max)
        }
        Err(e) => Err(e),
    }
}

fn search_with_rg(root: &Path, pattern: &str, max: usize) -> Result<Option<Vec<SearchMatch>>> {
    let spec = CommandSpec::new(
        [
            "rg",
            "--no-heading",
            "--line-number",
            "--hidden",
            "--color",
            "never",
            "--glob",
            "!.git",
            "--regexp",
            pattern,
            ".",
        ],
        root,
        SEARCH_TIMEOUT,
    );
    let out = match run(&spec, Mode::Lenient) {
        Ok(out) => out,
        Err(ProcessError::Spawn { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    // rg exits 1 when nothing matched.
    match out.exit_code() {
        Some(0) | Some(1) => {}
        _ => return Err(anyhow!("rg failed: {}", out.stderr_str().trim())),
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    Ok(Some(
        stdout
            .lines()
            .filter_map(parse_rg_line)
            .take(max)
            .collect(),
    ))
}

fn parse_rg_line(line: &str) -> Option<SearchMatch> {
    let (path, rest) = line.split_once(':')?;
    let (number, text) = rest.split_once(':')?;
    Some(SearchMatch {
        path: path.strip_prefix("./").unwrap_or(path).to_string(),
        line: number.parse().ok()?,
        text: text.to_string(),
    })
}

fn scan_with_regex(root: &Path, pattern: &str, max: usize) -> Result<Vec<SearchMatch>> {
    let re = Regex::new(pattern).with_context(|| format!("invalid pattern {pattern}"))?;
    let mut matches = Vec::new();
    for rel in list(root, None)? {
        // Binary and unreadable files are not searchable.
        let Ok(text) = fs::read_to_string(root.join(&rel)) else {
            continue;
        };
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                matches.push(SearchMatch {
                    path: rel.clone(),
                    line: idx + 1,
                    text: line.to_string(),
                });
                if matches.len() >= max {
                    return Ok(matches);
                }
            }
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["src/".to_string()]
    }

    #[test]
    fn read_small_file_whole_and_missing_as_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "hello\n").expect("write");

        match read(temp.path(), "a.txt").expect("read") {
            ReadOutcome::Ok {
                content, truncated, ..
            } => {
                assert_eq!(content, "hello\n");
                assert!(!truncated);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            read(temp.path(), "missing.txt").expect("read"),
            ReadOutcome::NotFound {
                path: "missing.txt".to_string()
            }
        );
        assert!(read(temp.path(), "../etc/passwd").is_err());
    }

    #[test]
    fn read_large_file_returns_preview() {
        let temp = tempfile::tempdir().expect("tempdir");
        let line = "x".repeat(999);
        let body: String = (0..600).map(|_| format!("{line}\n")).collect();
        fs::write(temp.path().join("big.txt"), &body).expect("write");

        let ReadOutcome::Ok {
            content, truncated, ..
        } = read(temp.path(), "big.txt").expect("read")
        else {
            panic!("expected content");
        };
        assert!(truncated);
        assert_eq!(content.lines().count(), READ_PREVIEW_LINES);
    }

    #[test]
    fn write_respects_allow_list_and_backs_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write(temp.path(), "README.md", "x", &prefixes(), true).is_err());
        assert!(write(temp.path(), "src/../../x", "x", &prefixes(), true).is_err());

        let first = write(temp.path(), "src/a.txt", "one", &prefixes(), true).expect("write");
        assert_eq!(first.backup, None);
        let second = write(temp.path(), "src/a.txt", "two", &prefixes(), true).expect("write");
        assert_eq!(second.backup.as_deref(), Some("src/a.txt.bak"));
        assert_eq!(
            fs::read_to_string(temp.path().join("src/a.txt.bak")).expect("bak"),
            "one"
        );

        let third = write(temp.path(), "src/a.txt", "three", &prefixes(), false).expect("write");
        assert_eq!(third.backup, None);
    }

    #[test]
    fn diff_uses_side_prefixes() {
        let out = diff("src/a.txt", "one\ntwo\n", "one\nthree\n");
        assert!(out.contains("--- a/src/a.txt"), "{out}");
        assert!(out.contains("+++ b/src/a.txt"), "{out}");
        assert!(out.contains("-two"));
        assert!(out.contains("+three"));
        assert_eq!(diff("x", "same\n", "same\n"), "");
    }

    #[test]
    fn list_skips_git_and_compiled_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join(".git/objects")).expect("git");
        fs::write(root.join(".git/HEAD"), "ref").expect("head");
        fs::create_dir_all(root.join("src/pkg")).expect("src");
        fs::write(root.join("src/pkg/mod.py"), "").expect("py");
        fs::write(root.join("src/pkg/mod.pyc"), "").expect("pyc");
        fs::write(root.join("README.md"), "").expect("readme");

        assert_eq!(
            list(root, None).expect("list"),
            vec!["README.md".to_string(), "src/pkg/mod.py".to_string()]
        );
        assert_eq!(
            list(root, Some("src")).expect("list"),
            vec!["src/pkg/mod.py".to_string()]
        );
    }

    #[test]
    fn regex_scan_finds_lines_and_caps() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("src");
        fs::write(temp.path().join("src/a.py"), "def login():\n    pass\ndef logout():\n")
            .expect("write");

        let all = scan_with_regex(temp.path(), r"def log", 10).expect("scan");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "src/a.py");
        assert_eq!(all[0].line, 1);
        assert_eq!(all[1].line, 3);

        assert_eq!(scan_with_regex(temp.path(), r"def", 1).expect("scan").len(), 1);
        assert!(scan_with_regex(temp.path(), r"(", 1).is_err());
    }

    #[test]
    fn search_finds_matches_with_either_backend() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("notes.txt"), "alpha\nbeta\n").expect("write");
        let found = search(temp.path(), "beta", DEFAULT_SEARCH_MAX).expect("search");
        assert_eq!(
            found,
            vec![SearchMatch {
                path: "notes.txt".to_string(),
                line: 2,
                text: "beta".to_string()
            }]
        );
    }

    #[test]
    fn parses_rg_output_lines() {
        let m = parse_rg_line("./src/a.rs:12:let x = 1;").expect("parse");
        assert_eq!(m.path, "src/a.rs");
        assert_eq!(m.line, 12);
        assert_eq!(m.text, "let x = 1;");
        assert!(parse_rg_line("garbage").is_none());
    }
}
