//! Persistence for the circuit breaker and its transition history.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::circuit::{CircuitBreakerState, Transition};
use crate::io::atomic::{load_json_or_default, write_json_atomic};
use crate::io::paths::ProjectPaths;

/// Transitions kept in `circuit_history.json`; older entries are dropped.
pub const MAX_HISTORY: usize = 100;

/// Circuit breaker state file plus its history file.
#[derive(Debug, Clone)]
pub struct CircuitStore {
    state_path: PathBuf,
    history_path: PathBuf,
}

impl CircuitStore {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            state_path: paths.circuit.clone(),
            history_path: paths.circuit_history.clone(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Load state; a missing or corrupted file yields a fresh CLOSED breaker.
    pub fn load(&self) -> CircuitBreakerState {
        load_json_or_default(&self.state_path, "circuit breaker state")
    }

    pub fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        debug!(state = %state.state, no_progress = state.consecutive_no_progress, "saving circuit breaker");
        write_json_atomic(&self.state_path, state)
    }

    pub fn history(&self) -> Vec<Transition> {
        load_json_or_default(&self.history_path, "circuit history")
    }

    /// Append a transition, keeping the newest [`MAX_HISTORY`] entries.
    pub fn append_transition(&self, transition: &Transition) -> Result<()> {
        info!(
            from = %transition.from,
            to = %transition.to,
            loop_number = transition.loop_number,
            reason = %transition.reason,
            "circuit breaker transition"
        );
        let mut history = self.history();
        history.push(transition.clone());
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        write_json_atomic(&self.history_path, &history)
    }

    /// Manual reset: CLOSED with zeroed counters, persisted.
    pub fn reset(&self, reason: &str, now: DateTime<Utc>) -> Result<CircuitBreakerState> {
        let mut state = self.load();
        if let Some(transition) = state.reset(reason, now) {
            self.append_transition(&transition)?;
        }
        self.save(&state)?;
        Ok(state)
    }
}
