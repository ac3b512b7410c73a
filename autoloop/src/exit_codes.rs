//! Stable exit codes for autoloop CLI commands.

/// Command succeeded, or the loop exited because the work is done.
pub const OK: i32 = 0;
/// Invalid configuration, unreadable state, or any other error.
pub const INVALID: i32 = 1;
/// The circuit breaker opened (or was already open) and halted the loop.
pub const CIRCUIT_OPEN: i32 = 2;
/// The hourly call budget ran out under `--no-wait`, or the agent hit its API limit.
pub const RATE_LIMITED: i32 = 3;
/// A pre-flight health check reported an error.
pub const HEALTH_CHECK_FAILED: i32 = 4;
/// `--max-loops` was reached before the work finished.
pub const MAX_LOOPS: i32 = 5;
/// Interrupted by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
