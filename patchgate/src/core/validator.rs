//! Allow-list validation for proposed patches.
//!
//! Validation is a pure function of the patch and the allow-list. It never
//! touches the workspace and must pass before anything is applied.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::core::patch::Patch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub accepted: bool,
    /// Offending paths, verbatim and in first-seen order.
    pub rejected_paths: Vec<String>,
}

impl ValidationResult {
    fn from_rejected(rejected_paths: Vec<String>) -> Self {
        Self {
            accepted: rejected_paths.is_empty(),
            rejected_paths,
        }
    }

    /// Fold in extra rejected paths (e.g. out-of-policy direct workspace edits).
    pub fn merge_rejected<I: IntoIterator<Item = String>>(mut self, extra: I) -> Self {
        for path in extra {
            if !self.rejected_paths.contains(&path) {
                self.rejected_paths.push(path);
            }
        }
        self.accepted = self.rejected_paths.is_empty();
        self
    }
}

/// Validate every path a patch touches against `allowed_prefixes`.
pub fn validate(patch: &Patch, allowed_prefixes: &[String]) -> ValidationResult {
    validate_paths(patch.touched_paths(), allowed_prefixes)
}

/// Validate an arbitrary path list against `allowed_prefixes`.
pub fn validate_paths<I, S>(paths: I, allowed_prefixes: &[String]) -> ValidationResult
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut rejected: Vec<String> = Vec::new();
    for path in paths {
        let path = path.into();
        if !is_allowed(&path, allowed_prefixes) && !rejected.contains(&path) {
            rejected.push(path);
        }
    }
    ValidationResult::from_rejected(rejected)
}

/// True if `path` stays inside the workspace and starts with an allowed prefix.
///
/// `path` is matched as written. Diff paths arrive with their `a/`/`b/` side
/// already removed by [`Patch::touched_paths`], so content-map keys and tool
/// writes get no such leniency.
pub fn is_allowed(path: &str, allowed_prefixes: &[String]) -> bool {
    if escapes_root(path) {
        return false;
    }
    allowed_prefixes
        .iter()
        .filter(|prefix| !prefix.is_empty())
        .any(|prefix| path.starts_with(prefix.as_str()))
}

fn escapes_root(path: &str) -> bool {
    Path::new(path).components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn src_only() -> Vec<String> {
        vec!["src/".to_string()]
    }

    #[test]
    fn accepts_content_map_inside_allow_list() {
        let patch = Patch::Files(BTreeMap::from([(
            "src/app/config.txt".to_string(),
            "new-content".to_string(),
        )]));
        let result = validate(&patch, &src_only());
        assert!(result.accepted);
        assert!(result.rejected_paths.is_empty());
    }

    #[test]
    fn rejects_absolute_diff_path_verbatim() {
        let patch = Patch::Diff("--- /etc/passwd\n+++ /etc/passwd\n@@ -1 +1 @@\n-x\n+y\n".into());
        let result = validate(&patch, &src_only());
        assert!(!result.accepted);
        assert_eq!(result.rejected_paths, vec!["/etc/passwd".to_string()]);
    }

    #[test]
    fn accepts_side_prefixed_diff_paths() {
        let patch = Patch::Diff("--- a/src/x.rs\n+++ b/src/x.rs\n".into());
        assert!(validate(&patch, &src_only()).accepted);
    }

    #[test]
    fn rejects_extended_diffs_outside_allow_list() {
        let mode_only = Patch::Diff(
            "diff --git a/README.md b/README.md\nold mode 100644\nnew mode 100755\n".into(),
        );
        let result = validate(&mode_only, &src_only());
        assert!(!result.accepted);
        assert_eq!(result.rejected_paths, vec!["README.md".to_string()]);

        let binary = Patch::Diff(
            "diff --git a/Makefile b/Makefile\nnew file mode 100644\nGIT binary patch\nliteral 4\nLcmYdHNi738#1R1}\n\nliteral 0\nHcmV?d00001\n\n"
                .into(),
        );
        assert_eq!(
            validate(&binary, &src_only()).rejected_paths,
            vec!["Makefile".to_string()]
        );
    }

    #[test]
    fn accepts_sql_comment_removed_inside_hunk() {
        let patch = Patch::Diff(
            "--- a/src/q.sql\n+++ b/src/q.sql\n@@ -1,2 +1 @@\n--- old comment\n select 1;\n".into(),
        );
        let result = validate(&patch, &src_only());
        assert!(result.accepted, "{:?}", result.rejected_paths);
    }

    #[test]
    fn side_prefix_is_not_stripped_from_content_map_keys() {
        let patch = Patch::Files(BTreeMap::from([("a/src/x".to_string(), "y".to_string())]));
        let result = validate(&patch, &src_only());
        assert!(!result.accepted);
        assert_eq!(result.rejected_paths, vec!["a/src/x".to_string()]);
        assert!(!is_allowed("b/src/x", &src_only()));
    }

    #[test]
    fn exact_file_prefix_matches() {
        let allowed = vec!["Cargo.toml".to_string()];
        assert!(is_allowed("Cargo.toml", &allowed));
        assert!(!is_allowed("Cargo.lock", &allowed));
    }

    #[test]
    fn rejects_traversal_even_with_matching_prefix() {
        assert!(!is_allowed("src/../../etc/passwd", &src_only()));
        assert!(!is_allowed("/src/x", &src_only()));
    }

    #[test]
    fn reports_only_offending_paths_once() {
        let result = validate_paths(
            ["src/ok.rs", "README.md", "README.md", "src/also.rs"],
            &src_only(),
        );
        assert!(!result.accepted);
        assert_eq!(result.rejected_paths, vec!["README.md".to_string()]);
    }

    #[test]
    fn empty_prefix_allows_nothing() {
        assert!(!is_allowed("anything", &[String::new()]));
    }

    #[test]
    fn merge_rejected_flips_acceptance() {
        let result = validate_paths(["src/a"], &src_only()).merge_rejected(["Makefile".to_string()]);
        assert!(!result.accepted);
        assert_eq!(result.rejected_paths, vec!["Makefile".to_string()]);
    }
}
