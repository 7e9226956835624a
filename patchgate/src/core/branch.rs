//! Branch name derivation.
//!
//! Branch names double as worktree directory names, so the alphabet is kept to
//! `[a-z0-9-]` and the length is bounded.

use std::fmt;

use serde::Serialize;

/// Maximum branch name length in characters.
pub const MAX_BRANCH_LEN: usize = 120;

/// Prefix used when a branch is derived from the instruction text.
pub const ISSUE_PREFIX: &str = "issue-";

/// Canonical branch identifier. Only constructed through [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize free-form text into a branch name.
///
/// Lowercases, replaces each run of characters outside `[a-z0-9-]` with a single
/// `-`, collapses repeated `-`, trims `-` from both ends and caps the length at
/// [`MAX_BRANCH_LEN`]. The trim runs again after truncation so a cut never
/// leaves a trailing separator, which keeps the function idempotent.
pub fn normalize(text: &str) -> BranchName {
    let mut out = String::with_capacity(text.len().min(MAX_BRANCH_LEN * 2));
    let mut last_dash = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let trimmed = out.trim_matches('-');
    // Output is pure ASCII, so byte and char lengths agree.
    let capped = &trimmed[..trimmed.len().min(MAX_BRANCH_LEN)];
    BranchName(capped.trim_end_matches('-').to_string())
}

/// Derive the branch for a change request.
///
/// An explicit branch is normalized as given; otherwise the instruction is
/// prefixed with [`ISSUE_PREFIX`] before normalizing.
pub fn derive_branch(instruction: &str, requested: Option<&str>) -> BranchName {
    match requested {
        Some(branch) => normalize(branch),
        None => normalize(&format!("{ISSUE_PREFIX}{instruction}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn shape() -> Regex {
        Regex::new(r"^[a-z0-9](-?[a-z0-9]+)*$|^$").expect("regex")
    }

    #[test]
    fn derives_issue_branch_from_instruction() {
        let branch = derive_branch("Fix bug in login flow", None);
        assert_eq!(branch.as_str(), "issue-fix-bug-in-login-flow");
    }

    #[test]
    fn explicit_branch_is_normalized_without_prefix() {
        let branch = derive_branch("ignored", Some("Feature/Add OAuth"));
        assert_eq!(branch.as_str(), "feature-add-oauth");
    }

    #[test]
    fn collapses_and_trims_separators() {
        assert_eq!(normalize("--a__b  c--").as_str(), "a-b-c");
        assert_eq!(normalize("a---b").as_str(), "a-b");
        assert_eq!(normalize("!!!").as_str(), "");
    }

    #[test]
    fn non_ascii_letters_become_separators() {
        assert_eq!(normalize("Ünïcode café").as_str(), "n-code-caf");
    }

    #[test]
    fn truncation_never_leaves_trailing_dash() {
        let input = format!("{}-tail", "a".repeat(MAX_BRANCH_LEN - 1));
        let branch = normalize(&input);
        assert_eq!(branch.as_str().len(), MAX_BRANCH_LEN - 1);
        assert!(!branch.as_str().ends_with('-'));
    }

    #[test]
    fn normalize_is_idempotent_and_well_formed() {
        let samples = [
            "Fix bug in login flow",
            "  spaces  everywhere ",
            "UPPER_case/mixed.Path",
            "emoji 🚀 rocket",
            "---",
            "",
            "x",
            &"long segment ".repeat(30),
            &format!("{}--{}", "b".repeat(119), "c".repeat(10)),
        ];
        let re = shape();
        for sample in samples {
            let once = normalize(sample);
            let twice = normalize(once.as_str());
            assert_eq!(once, twice, "not idempotent for {sample:?}");
            assert!(once.as_str().len() <= MAX_BRANCH_LEN);
            assert!(re.is_match(once.as_str()), "bad shape {:?}", once.as_str());
        }
    }
}
