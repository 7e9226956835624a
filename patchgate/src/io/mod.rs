//! Side-effecting adapters: processes, git, the filesystem, and the proposer
//! and hosting boundaries.

pub mod apply;
pub mod config;
pub mod git;
pub mod lock;
pub mod process;
pub mod proposer;
pub mod publish;
pub mod run_log;
pub mod tools;
pub mod verify;
pub mod workspace;
