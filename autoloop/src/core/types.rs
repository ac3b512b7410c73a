//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Output format the agent is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            other => Err(format!("unknown output format '{other}' (expected json|text)")),
        }
    }
}

/// Agent-declared status from a structured status block or JSON metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    InProgress,
    Complete,
    Blocked,
}

impl AgentStatus {
    /// Parse a loosely formatted status value (`COMPLETE`, `in progress`, `done`).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_ascii_uppercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "COMPLETE" | "COMPLETED" | "DONE" => Some(AgentStatus::Complete),
            "IN_PROGRESS" | "WORKING" | "CONTINUE" => Some(AgentStatus::InProgress),
            "BLOCKED" | "STUCK" => Some(AgentStatus::Blocked),
            _ => None,
        }
    }
}

/// Outcome of one iteration, produced by the response analyzer.
///
/// Created once per iteration and never mutated afterwards; the circuit breaker
/// and exit gate only read it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopRecord {
    /// Loop number (1-indexed, monotonic across resumes).
    pub loop_number: u32,
    /// Files changed according to the git diff taken around the invocation.
    pub files_changed: u32,
    pub has_errors: bool,
    /// Explicit completion status reported by the agent (not the phrase heuristic).
    pub has_completion_signal: bool,
    /// Explicit `EXIT_SIGNAL: true` from the agent.
    pub exit_signal: bool,
    /// Files the agent claims to have modified; may exceed `files_changed` when
    /// the agent committed its own work.
    pub files_modified_reported: u32,
    pub has_permission_denials: bool,
    /// Bytes of captured stdout.
    pub output_length: usize,
    /// Completion phrases matched in the agent's narrative.
    pub completion_indicators: u32,
    /// The iteration only ran or wrote tests.
    pub is_test_only: bool,
    pub tasks_completed: u32,
    pub api_limit_reached: bool,
    pub session_id: Option<String>,
    pub summary: Option<String>,
}

impl LoopRecord {
    /// Any evidence that the iteration moved the project forward.
    pub fn has_progress(&self) -> bool {
        self.files_changed > 0
            || self.has_completion_signal
            || self.exit_signal
            || self.files_modified_reported > 0
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the circuit breaker opened. Each cause maps to a different remedy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    NoProgress,
    SameError,
    PermissionDenied,
}

impl HaltReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HaltReason::NoProgress => "no_progress",
            HaltReason::SameError => "same_error",
            HaltReason::PermissionDenied => "permission_denied",
        }
    }

    /// Recovery suggestion shown when the loop halts for this reason.
    pub fn suggestion(self) -> &'static str {
        match self {
            HaltReason::NoProgress => {
                "The agent stopped making changes. Review .autoloop/fix_plan.md for \
                 remaining work, check that ALLOWED_TOOLS lets the agent edit files, then run \
                 `autoloop reset-circuit`."
            }
            HaltReason::SameError => {
                "The agent kept failing. Inspect .autoloop/iterations/*/agent.log for the \
                 repeated failure, fix the underlying problem, then run `autoloop reset-circuit`."
            }
            HaltReason::PermissionDenied => {
                "The agent was denied tool permissions. Widen ALLOWED_TOOLS in .autolooprc \
                 (or pass --allowed-tools), then run `autoloop reset-circuit`."
            }
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason for a normal (non-halting) exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Dual-condition gate: completion confidence plus explicit exit signal.
    ProjectComplete,
    /// Every task in the fix plan is checked off.
    PlanComplete,
    /// Consecutive iterations explicitly declared completion.
    CompletionSignals,
    /// Recent iterations were almost entirely test-only work.
    TestSaturation,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::ProjectComplete => "project_complete",
            ExitReason::PlanComplete => "plan_complete",
            ExitReason::CompletionSignals => "completion_signals",
            ExitReason::TestSaturation => "test_saturation",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level state of the loop controller (distinct from the circuit state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    PausedRateLimit,
    HaltedCircuitOpen,
    HaltedHealthCheck,
    HaltedRateLimit,
    HaltedMaxLoops,
    ExitedComplete,
    ExitedUser,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Idle => "IDLE",
            LoopState::Running => "RUNNING",
            LoopState::PausedRateLimit => "PAUSED_RATE_LIMIT",
            LoopState::HaltedCircuitOpen => "HALTED_CIRCUIT_OPEN",
            LoopState::HaltedHealthCheck => "HALTED_HEALTH_CHECK",
            LoopState::HaltedRateLimit => "HALTED_RATE_LIMIT",
            LoopState::HaltedMaxLoops => "HALTED_MAX_LOOPS",
            LoopState::ExitedComplete => "EXITED_COMPLETE",
            LoopState::ExitedUser => "EXITED_USER",
        }
    }

    /// True once the run has stopped for good.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            LoopState::Idle | LoopState::Running | LoopState::PausedRateLimit
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
