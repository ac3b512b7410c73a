//! Exit gate: decides whether the loop continues, exits, or halts.
//!
//! Pure function of recent [`LoopRecord`]s, the external task tally, and the
//! circuit state. The primary rule is dual-condition: completion phrases only
//! count in iterations where the agent also set `EXIT_SIGNAL: true`, and the
//! latest iteration must carry that explicit signal. An agent narrating
//! "almost done" while still working never ends the loop.

use crate::core::plan::TaskProgress;
use crate::core::types::{CircuitState, ExitReason, HaltReason, LoopRecord};

/// Gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitGateConfig {
    /// Completion confidence needed for the dual-condition exit.
    pub completion_threshold: u32,
    /// Consecutive explicit "done" iterations that exit on their own.
    pub max_done_signals: u32,
    /// Trailing window (in iterations) for confidence and test-only ratios.
    pub window: usize,
    /// Test-only iterations within the window that signal diminishing returns.
    pub max_test_only_loops: u32,
}

impl Default for ExitGateConfig {
    fn default() -> Self {
        Self {
            completion_threshold: 2,
            max_done_signals: 2,
            window: 5,
            max_test_only_loops: 3,
        }
    }
}

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Exit(ExitReason),
    Halt(HaltReason),
}

/// Everything the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    /// Oldest first; the last element is the current iteration.
    pub history: &'a [LoopRecord],
    pub tasks: Option<TaskProgress>,
    pub circuit: CircuitState,
    pub halt_reason: Option<HaltReason>,
}

/// Evaluate the gate.
pub fn evaluate(input: &GateInput<'_>, config: &ExitGateConfig) -> GateDecision {
    if input.circuit == CircuitState::Open {
        return GateDecision::Halt(input.halt_reason.unwrap_or(HaltReason::NoProgress));
    }
    let Some(latest) = input.history.last() else {
        return GateDecision::Continue;
    };
    let window = trailing(input.history, config.window);

    if latest.exit_signal && completion_confidence(window) >= config.completion_threshold {
        return GateDecision::Exit(ExitReason::ProjectComplete);
    }
    if input.tasks.is_some_and(|tasks| tasks.all_complete()) {
        return GateDecision::Exit(ExitReason::PlanComplete);
    }
    if config.max_done_signals > 0 && consecutive_done(input.history) >= config.max_done_signals {
        return GateDecision::Exit(ExitReason::CompletionSignals);
    }
    if config.max_test_only_loops > 0
        && window.iter().filter(|r| r.is_test_only).count() as u32 >= config.max_test_only_loops
    {
        return GateDecision::Exit(ExitReason::TestSaturation);
    }
    GateDecision::Continue
}

/// Completion indicators summed over iterations that also signalled exit.
pub fn completion_confidence(records: &[LoopRecord]) -> u32 {
    records
        .iter()
        .filter(|r| r.exit_signal)
        .map(|r| r.completion_indicators)
        .sum()
}

/// Trailing run of iterations that explicitly declared completion and exit.
fn consecutive_done(history: &[LoopRecord]) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|r| r.has_completion_signal && r.exit_signal)
        .count() as u32
}

fn trailing(history: &[LoopRecord], window: usize) -> &[LoopRecord] {
    let start = history.len().saturating_sub(window.max(1));
    &history[start..]
}
