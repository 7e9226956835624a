//! Stable exit codes for the patchgate CLI.

/// Run ended in its success state (`Published`, or `Verified` for a dry run),
/// or a tool/utility command succeeded.
pub const OK: i32 = 0;
/// Invalid usage, configuration, repository, or an I/O error before the
/// pipeline could start.
pub const INVALID: i32 = 1;
/// The pipeline ended in `Failed`.
pub const FAILED: i32 = 2;
