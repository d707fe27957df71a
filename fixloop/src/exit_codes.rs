//! Stable exit codes for fixloop CLI commands.

/// Command succeeded; for `run`, the session completed cleanly.
pub const OK: i32 = 0;
/// Command failed due to invalid config/arguments or an internal error.
pub const INVALID: i32 = 1;
/// `run` found a live session already holding the project+branch lock.
pub const ALREADY_RUNNING: i32 = 2;
/// The session ended in a fatal phase error.
pub const SESSION_FAILED: i32 = 3;
/// The session was interrupted by a stop request.
pub const INTERRUPTED: i32 = 4;
/// The session hit its iteration bound without a terminal decision.
pub const MAX_ITERATIONS: i32 = 5;
