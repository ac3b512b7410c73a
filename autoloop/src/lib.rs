//! Supervised autonomous coding-agent loop.
//!
//! This crate drives an agent CLI in a bounded loop: each iteration builds a
//! prompt, invokes the agent once, measures what changed, and decides whether
//! to continue, exit, or halt. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (response analysis, circuit
//!   breaker, rate limiting, exit gate, session diagnosis). No I/O, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution).
//!   Isolated to enable mocking in tests.
//!
//! Orchestration modules ([`step`], [`looping`], [`status`], [`reset`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod reset;
pub mod status;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
