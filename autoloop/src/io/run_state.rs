//! Loop controller status record (`.autoloop/state/run_state.json`).

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{LoopRecord, LoopState};
use crate::io::atomic::{load_json_or_default, write_json_atomic};

/// Persisted bookkeeping for the current or most recent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunState {
    /// Identifier for the current execution run.
    pub run_id: Option<String>,
    pub state: LoopState,
    /// Last loop number started (monotonic across runs).
    pub loop_count: u32,
    /// Invocations made during this run.
    pub calls_this_run: u32,
    /// Reason code for the latest halt or exit.
    pub reason: Option<String>,
    /// Recovery suggestion for the latest halt.
    pub suggestion: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_record: Option<LoopRecord>,
}

impl RunState {
    /// Next loop number to use.
    pub fn next_loop(&self) -> u32 {
        self.loop_count.saturating_add(1)
    }
}

/// Load run state; a missing or corrupted file yields the default.
pub fn load_run_state(path: &Path) -> RunState {
    let state: RunState = load_json_or_default(path, "run state");
    debug!(run_id = ?state.run_id, loop_count = state.loop_count, state = %state.state, "run state loaded");
    state
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), state = %state.state, loop_count = state.loop_count, "writing run state");
    write_json_atomic(path, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");

        let state = RunState {
            run_id: Some("run-123".to_string()),
            state: LoopState::HaltedCircuitOpen,
            loop_count: 5,
            calls_this_run: 5,
            reason: Some("no_progress".to_string()),
            suggestion: Some("check the fix plan".to_string()),
            started_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            last_record: Some(LoopRecord {
                loop_number: 5,
                ..LoopRecord::default()
            }),
        };

        write_run_state(&path, &state).expect("write");
        assert_eq!(load_run_state(&path), state);
    }

    #[test]
    fn run_state_defaults_are_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");

        write_run_state(&path, &RunState::default()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let expected = "{\n  \"run_id\": null,\n  \"state\": \"IDLE\",\n  \"loop_count\": 0,\n  \"calls_this_run\": 0,\n  \"reason\": null,\n  \"suggestion\": null,\n  \"started_at\": null,\n  \"updated_at\": null,\n  \"last_record\": null\n}\n";
        assert_eq!(contents, expected);
        assert_eq!(RunState::default().next_loop(), 1);
    }

    #[test]
    fn corrupted_run_state_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");
        fs::write(&path, "not json").expect("write");
        assert_eq!(load_run_state(&path), RunState::default());
    }
}
