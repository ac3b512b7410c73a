//! Circuit breaker state machine.
//!
//! Three independent stagnation counters feed one state machine:
//!
//! ```text
//! CLOSED ──(2 loops without progress)──▶ HALF_OPEN ──(progress)──▶ CLOSED
//!    │                                       │
//!    └──(threshold reached)──▶ OPEN ◀────────┘
//! ```
//!
//! OPEN is terminal until [`CircuitBreakerState::reset`] is called explicitly.
//! The state is plain data; persistence lives in `io::circuit_store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{CircuitState, HaltReason, LoopRecord};

/// Loops without progress that move CLOSED to HALF_OPEN.
pub const HALF_OPEN_AFTER: u32 = 2;

/// Trip thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitThresholds {
    pub no_progress: u32,
    pub same_error: u32,
    pub permission_denial: u32,
    /// Percentage drop in output length that is reported as a warning sign.
    pub output_decline_percent: u32,
}

impl Default for CircuitThresholds {
    fn default() -> Self {
        Self {
            no_progress: 3,
            same_error: 5,
            permission_denial: 2,
            output_decline_percent: 70,
        }
    }
}

/// Persisted circuit breaker state.
///
/// Unknown fields are ignored and missing fields take defaults, so older and
/// newer state files both load.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub consecutive_permission_denials: u32,
    pub last_progress_loop: u32,
    pub total_opens: u32,
    /// Human-readable cause of the latest transition.
    pub reason: Option<String>,
    /// Machine-readable cause while OPEN.
    pub halt_reason: Option<HaltReason>,
    pub current_loop: u32,
    pub last_output_length: usize,
    pub last_change: Option<DateTime<Utc>>,
}

/// One state change, appended to the transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub timestamp: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub loop_number: u32,
}

/// Result of feeding one record to the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitUpdate {
    pub transition: Option<Transition>,
    /// Output shrank by at least the decline threshold on a loop without progress.
    pub output_declined: bool,
}

/// Message shown when the breaker blocks further loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltNotice {
    pub reason: HaltReason,
    pub message: String,
    pub suggestion: String,
}

impl CircuitBreakerState {
    /// Feed one iteration's record through the breaker.
    pub fn record(
        &mut self,
        record: &LoopRecord,
        thresholds: &CircuitThresholds,
        now: DateTime<Utc>,
    ) -> CircuitUpdate {
        self.current_loop = record.loop_number;
        let has_progress = record.has_progress();
        let output_declined = !has_progress
            && output_declined(
                self.last_output_length,
                record.output_length,
                thresholds.output_decline_percent,
            );
        self.last_output_length = record.output_length;

        if has_progress {
            self.consecutive_no_progress = 0;
            self.last_progress_loop = record.loop_number;
        } else {
            self.consecutive_no_progress += 1;
        }
        if record.has_errors {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 0;
        }
        if record.has_permission_denials {
            self.consecutive_permission_denials += 1;
        } else {
            self.consecutive_permission_denials = 0;
        }

        let next = match self.state {
            CircuitState::Closed => self.from_closed(thresholds),
            CircuitState::HalfOpen => self.from_half_open(has_progress, thresholds),
            CircuitState::Open => None,
        };

        let transition = next.map(|(to, halt_reason, mut reason)| {
            if output_declined {
                reason.push_str(" (output length declined sharply)");
            }
            let transition = Transition {
                timestamp: now,
                from: self.state,
                to,
                reason: reason.clone(),
                loop_number: record.loop_number,
            };
            if to == CircuitState::Open {
                self.total_opens += 1;
            }
            self.state = to;
            self.halt_reason = halt_reason;
            self.reason = Some(reason);
            self.last_change = Some(now);
            transition
        });

        CircuitUpdate {
            transition,
            output_declined,
        }
    }

    fn from_closed(
        &self,
        thresholds: &CircuitThresholds,
    ) -> Option<(CircuitState, Option<HaltReason>, String)> {
        if let Some(open) = self.open_for_permissions(thresholds) {
            return Some(open);
        }
        if self.consecutive_no_progress >= thresholds.no_progress {
            return Some(self.open_for_no_progress());
        }
        if self.consecutive_same_error >= thresholds.same_error {
            return Some((
                CircuitState::Open,
                Some(HaltReason::SameError),
                format!(
                    "Same error repeated in {} consecutive loops",
                    self.consecutive_same_error
                ),
            ));
        }
        if self.consecutive_no_progress >= HALF_OPEN_AFTER {
            return Some((
                CircuitState::HalfOpen,
                None,
                format!(
                    "Monitoring: {} consecutive loops without progress",
                    self.consecutive_no_progress
                ),
            ));
        }
        None
    }

    fn from_half_open(
        &self,
        has_progress: bool,
        thresholds: &CircuitThresholds,
    ) -> Option<(CircuitState, Option<HaltReason>, String)> {
        if let Some(open) = self.open_for_permissions(thresholds) {
            return Some(open);
        }
        if has_progress {
            return Some((
                CircuitState::Closed,
                None,
                "Progress detected, circuit recovered".to_string(),
            ));
        }
        if self.consecutive_no_progress >= thresholds.no_progress {
            return Some(self.open_for_no_progress());
        }
        None
    }

    fn open_for_permissions(
        &self,
        thresholds: &CircuitThresholds,
    ) -> Option<(CircuitState, Option<HaltReason>, String)> {
        (self.consecutive_permission_denials >= thresholds.permission_denial).then(|| {
            (
                CircuitState::Open,
                Some(HaltReason::PermissionDenied),
                format!(
                    "Permission denied in {} consecutive loops",
                    self.consecutive_permission_denials
                ),
            )
        })
    }

    fn open_for_no_progress(&self) -> (CircuitState, Option<HaltReason>, String) {
        (
            CircuitState::Open,
            Some(HaltReason::NoProgress),
            format!(
                "No progress detected in {} consecutive loops",
                self.consecutive_no_progress
            ),
        )
    }

    /// False only while OPEN.
    pub fn can_execute(&self) -> bool {
        self.state != CircuitState::Open
    }

    /// Halt notice with a recovery suggestion, or `None` when loops may run.
    pub fn should_halt(&self) -> Option<HaltNotice> {
        if self.can_execute() {
            return None;
        }
        let reason = self
            .halt_reason
            .or_else(|| self.reason.as_deref().map(halt_reason_from_text))
            .unwrap_or(HaltReason::NoProgress);
        Some(HaltNotice {
            reason,
            message: self
                .reason
                .clone()
                .unwrap_or_else(|| format!("circuit breaker is {}", self.state)),
            suggestion: reason.suggestion().to_string(),
        })
    }

    /// Return to the default CLOSED state, zeroing every counter.
    ///
    /// Returns the transition to record, or `None` when the breaker was already
    /// in its default state.
    pub fn reset(&mut self, reason: &str, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;
        let was_default = *self == CircuitBreakerState::default();
        *self = CircuitBreakerState::default();
        (!was_default).then(|| Transition {
            timestamp: now,
            from,
            to: CircuitState::Closed,
            reason: reason.to_string(),
            loop_number: 0,
        })
    }
}

/// Map a free-text reason (older state files carry no code) to a halt reason.
fn halt_reason_from_text(reason: &str) -> HaltReason {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("permission") {
        HaltReason::PermissionDenied
    } else if lower.contains("error") {
        HaltReason::SameError
    } else {
        HaltReason::NoProgress
    }
}

fn output_declined(previous: usize, current: usize, threshold_percent: u32) -> bool {
    if previous == 0 || current >= previous {
        return false;
    }
    let decline = (previous - current) as u128 * 100 / previous as u128;
    decline >= threshold_percent as u128
}
