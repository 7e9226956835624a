//! Proposed patch model and header parsing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A change proposed for the workspace.
///
/// Serialized externally tagged: `{"diff": "..."}` or `{"files": {"path": "content"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Patch {
    /// Unified diff text, applied against both the working tree and the index.
    Diff(String),
    /// Relative path to full new file content.
    Files(BTreeMap<String, String>),
}

impl Patch {
    pub fn kind(&self) -> PatchKind {
        match self {
            Patch::Diff(_) => PatchKind::Diff,
            Patch::Files(_) => PatchKind::Files,
        }
    }

    /// True when applying the patch cannot change anything.
    pub fn is_empty(&self) -> bool {
        match self {
            Patch::Diff(text) => text.trim().is_empty(),
            Patch::Files(files) => files.is_empty(),
        }
    }

    /// Paths the patch touches, in first-seen order, without duplicates.
    pub fn touched_paths(&self) -> Vec<String> {
        match self {
            Patch::Diff(text) => diff_header_paths(text),
            Patch::Files(files) => files.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Diff,
    Files,
}

/// Per-file line counts for a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub files: Vec<String>,
    pub added: usize,
    pub removed: usize,
}

/// Extract every file path a diff touches, as `git apply -p1` resolves them.
///
/// Reads `diff --git` headers, `---`/`+++` headers outside hunks (dropping any
/// tab-separated timestamp) and the `rename`/`copy` extended headers. Hunk
/// bodies are skipped by their `@@` line counts, so content lines that look
/// like headers are never taken as paths. `/dev/null` is skipped. Relative
/// header paths lose their first component (`a/src/x` becomes `src/x`).
/// Absolute paths and headers that cannot be split are kept verbatim.
pub fn diff_header_paths(text: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut hunk = Hunk::default();
    for line in text.lines() {
        if hunk.consume(line).is_some() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("diff --git ") {
            for path in git_header_paths(rest) {
                push_unique(&mut paths, path);
            }
        } else if let Some(raw) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        {
            if let Some(path) = side_path(raw) {
                push_unique(&mut paths, path);
            }
        } else if let Some(raw) = EXTENDED_HEADERS
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
        {
            let raw = unquote(raw.trim());
            if !raw.is_empty() {
                push_unique(&mut paths, raw.to_string());
            }
        } else if let Some(next) = Hunk::parse(line) {
            hunk = next;
        }
    }
    paths
}

/// Summarize a unified diff: touched files and added/removed line counts.
pub fn summarize_diff(text: &str) -> DiffSummary {
    let mut summary = DiffSummary {
        files: diff_header_paths(text),
        ..DiffSummary::default()
    };
    let mut hunk = Hunk::default();
    for line in text.lines() {
        match hunk.consume(line) {
            Some(HunkLine::Added) => summary.added += 1,
            Some(HunkLine::Removed) => summary.removed += 1,
            Some(HunkLine::Context) => {}
            None => {
                if let Some(next) = Hunk::parse(line) {
                    hunk = next;
                }
            }
        }
    }
    summary
}

const EXTENDED_HEADERS: [&str; 4] = ["rename from ", "rename to ", "copy from ", "copy to "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkLine {
    Context,
    Added,
    Removed,
}

/// Lines still expected in the current hunk, per side.
#[derive(Debug, Default)]
struct Hunk {
    old: usize,
    new: usize,
}

impl Hunk {
    /// Parse `@@ -a[,b] +c[,d] @@`. Omitted counts are 1.
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("@@ -")?;
        let (ranges, _) = rest.split_once(" @@")?;
        let (old, new) = ranges.split_once(" +")?;
        Some(Self {
            old: range_len(old)?,
            new: range_len(new)?,
        })
    }

    /// Classify `line` if it belongs to the open hunk.
    fn consume(&mut self, line: &str) -> Option<HunkLine> {
        if self.old == 0 && self.new == 0 {
            return None;
        }
        let kind = match line.as_bytes().first() {
            Some(b'-') => {
                self.old = self.old.saturating_sub(1);
                HunkLine::Removed
            }
            Some(b'+') => {
                self.new = self.new.saturating_sub(1);
                HunkLine::Added
            }
            // "\ No newline at end of file"
            Some(b'\\') => HunkLine::Context,
            // Some tools strip the space from empty context lines.
            Some(b' ') | None => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
                HunkLine::Context
            }
            Some(_) => {
                *self = Self::default();
                return None;
            }
        };
        Some(kind)
    }
}

fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((start, len)) => {
            start.parse::<usize>().ok()?;
            len.parse().ok()
        }
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

fn push_unique(paths: &mut Vec<String>, path: String) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

/// Path from a `---`/`+++` header, or `None` for `/dev/null`.
fn side_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = unquote(raw);
    if raw.is_empty() || raw == "/dev/null" {
        return None;
    }
    Some(strip_first_component(raw).to_string())
}

/// Both paths of `diff --git <a> <b>`.
///
/// Unquoted names are split where both halves resolve to the same path, then
/// at the last ` b/`. A header that fits neither is returned whole.
fn git_header_paths(rest: &str) -> Vec<String> {
    let rest = rest.trim_end();
    if rest.starts_with('"') {
        if let Some((old, new)) = rest.split_once("\" \"") {
            let old = old.strip_prefix('"').unwrap_or(old);
            let new = new.strip_suffix('"').unwrap_or(new);
            return vec![
                strip_first_component(old).to_string(),
                strip_first_component(new).to_string(),
            ];
        }
        return vec![rest.to_string()];
    }
    let mid = rest.len() / 2;
    if rest.len() % 2 == 1
        && rest.is_char_boundary(mid)
        && rest.as_bytes()[mid] == b' '
        && strip_first_component(&rest[..mid]) == strip_first_component(&rest[mid + 1..])
    {
        return vec![strip_first_component(&rest[..mid]).to_string()];
    }
    match rest.rfind(" b/") {
        Some(at) => vec![
            strip_first_component(&rest[..at]).to_string(),
            strip_first_component(&rest[at + 1..]).to_string(),
        ],
        None => vec![rest.to_string()],
    }
}

/// Drop the leading path component the way `git apply -p1` does. Absolute
/// paths and single-component names are returned unchanged.
pub fn strip_first_component(path: &str) -> &str {
    if path.starts_with('/') {
        return path;
    }
    match path.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => path,
    }
}

fn unquote(path: &str) -> &str {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}
