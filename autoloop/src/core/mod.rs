//! Deterministic, pure logic shared by the loop supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take the current time as an argument where it matters, and
//! return deterministic outputs suitable for tests.

pub mod analyzer;
pub mod circuit;
pub mod exit_gate;
pub mod heuristics;
pub mod plan;
pub mod rate_limit;
pub mod session;
pub mod types;
