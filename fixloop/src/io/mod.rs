//! Side-effecting operations: streams, processes, lock files, logs, config.

pub mod agents;
pub mod config;
pub mod git;
pub mod lockfile;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod stream;
