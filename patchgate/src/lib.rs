//! Repository mutation pipeline.
//!
//! Takes a free-form change request, isolates a git worktree for it, lets an
//! external proposer suggest changes, and only commits and pushes them once
//! they pass the allow-list, apply cleanly, and survive the configured tests.
//!
//! - **[`core`]**: Pure, deterministic logic (branch names, patch parsing,
//!   allow-list validation, the state machine). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, filesystem, proposer
//!   and hosting boundaries).
//! - **[`pipeline`]**: The orchestrator that sequences them.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
