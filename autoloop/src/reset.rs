//! Manual reset operations behind `autoloop reset-circuit` and `reset-session`.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::core::circuit::CircuitBreakerState;
use crate::core::types::CircuitState;
use crate::io::circuit_store::CircuitStore;
use crate::io::paths::ProjectPaths;
use crate::io::session_store::{SessionResetReason, SessionStore};

/// Outcome of `reset-circuit`.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitResetOutcome {
    pub previous: CircuitState,
    pub changed: bool,
    pub state: CircuitBreakerState,
}

/// Outcome of `reset-session`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResetOutcome {
    pub removed: bool,
    pub reason: SessionResetReason,
}

/// Put the breaker back to CLOSED with zeroed counters. Idempotent.
pub fn reset_circuit(root: &Path, reason: &str, now: DateTime<Utc>) -> Result<CircuitResetOutcome> {
    let paths = ProjectPaths::new(root);
    let store = CircuitStore::new(&paths);
    let before = store.load();
    let state = store.reset(reason, now)?;
    let changed = before != state;
    info!(from = %before.state, changed, "circuit breaker reset");
    Ok(CircuitResetOutcome {
        previous: before.state,
        changed,
        state,
    })
}

/// Discard the stored session so the next iteration starts fresh. Idempotent.
pub fn reset_session(root: &Path, now: DateTime<Utc>) -> Result<SessionResetOutcome> {
    let paths = ProjectPaths::new(root);
    let reason = SessionResetReason::ManualReset;
    let removed = SessionStore::new(&paths).reset(reason, now)?;
    Ok(SessionResetOutcome { removed, reason })
}
