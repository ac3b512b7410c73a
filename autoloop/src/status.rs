//! Read-only status reports for `autoloop status`, `circuit-status`, and `session-status`.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::circuit::{CircuitBreakerState, HaltNotice, Transition};
use crate::core::rate_limit::WINDOW_SECS;
use crate::core::session::SessionReport;
use crate::core::types::LoopRecord;
use crate::io::circuit_store::CircuitStore;
use crate::io::config::{LoopConfig, load_config};
use crate::io::loop_history::LoopHistory;
use crate::io::paths::ProjectPaths;
use crate::io::rate_store::TrackedRateLimiter;
use crate::io::run_state::{RunState, load_run_state};
use crate::io::session_store::{SessionEvent, SessionStore};

/// Transitions and records included in reports.
const RECENT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitReport {
    pub calls_made: u32,
    pub max_calls: u32,
    pub remaining: u32,
    pub resets_in_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitReport {
    #[serde(flatten)]
    pub state: CircuitBreakerState,
    pub can_execute: bool,
    pub halt: Option<HaltNotice>,
    pub recent_transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub report: SessionReport,
    pub continuity: bool,
    pub recent_events: Vec<SessionEvent>,
}

/// Everything `autoloop status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub run: RunState,
    pub circuit: CircuitReport,
    pub rate_limit: RateLimitReport,
    pub session: SessionStatus,
    pub recent_loops: Vec<LoopRecord>,
}

pub fn circuit_report(paths: &ProjectPaths) -> CircuitReport {
    let store = CircuitStore::new(paths);
    let state = store.load();
    let history = store.history();
    let skip = history.len().saturating_sub(RECENT);
    CircuitReport {
        can_execute: state.can_execute(),
        halt: state.should_halt(),
        recent_transitions: history.into_iter().skip(skip).collect(),
        state,
    }
}

pub fn session_status(paths: &ProjectPaths, config: &LoopConfig, now: DateTime<Utc>) -> SessionStatus {
    let store = SessionStore::new(paths);
    let history = store.history();
    let skip = history.len().saturating_sub(RECENT);
    SessionStatus {
        report: store.diagnose(now, config.session_expiry_hours),
        continuity: config.session_continuity,
        recent_events: history.into_iter().skip(skip).collect(),
    }
}

/// Gather the full report. Reads state only; an elapsed window is reported
/// as reset without persisting the rollover.
pub fn status_report(root: &Path, now: DateTime<Utc>) -> Result<StatusReport> {
    let paths = ProjectPaths::new(root);
    let config = load_config(&paths.config)?;

    let limiter = TrackedRateLimiter::load(&paths, config.max_calls_per_hour);
    let counters = limiter.counters();
    let window_over = now.timestamp() >= counters.window_start + WINDOW_SECS;
    let calls_made = if window_over { 0 } else { counters.call_count };
    let rate_limit = RateLimitReport {
        calls_made,
        max_calls: config.max_calls_per_hour,
        remaining: config.max_calls_per_hour.saturating_sub(calls_made),
        resets_in_secs: if window_over {
            0
        } else {
            limiter.seconds_until_reset(now)
        },
    };

    let history = LoopHistory::load(&paths.loop_history);
    let records = history.records();
    let skip = records.len().saturating_sub(RECENT);

    Ok(StatusReport {
        generated_at: now,
        run: load_run_state(&paths.run_state),
        circuit: circuit_report(&paths),
        rate_limit,
        session: session_status(&paths, &config, now),
        recent_loops: records[skip..].to_vec(),
    })
}
