//! I/O adapters for the loop supervisor: filesystem state, git, and processes.

pub mod atomic;
pub mod cancel;
pub mod circuit_store;
pub mod config;
pub mod executor;
pub mod git;
pub mod health;
pub mod iteration_log;
pub mod loop_history;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod rate_store;
pub mod run_state;
pub mod session_store;
