//! Multi-iteration loop controller for `autoloop run`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::circuit::HaltNotice;
use crate::core::exit_gate::GateDecision;
use crate::core::types::{ExitReason, HaltReason, LoopState};
use crate::exit_codes;
use crate::io::cancel::{CancelToken, WaitOutcome};
use crate::io::config::LoopConfig;
use crate::io::executor::Executor;
use crate::io::health::{HealthInput, HealthReport, ToolLocator, run_health_checks};
use crate::io::paths::ProjectPaths;
use crate::io::session_store::SessionResetReason;
use crate::step::{LoopRuntime, StepOutcome, run_step};

/// What ran out when the loop stops for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitCause {
    /// The local hourly call budget.
    Budget,
    /// The agent reported its provider's usage limit.
    ApiLimit,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The exit gate decided the work is done.
    Complete { reason: ExitReason },
    /// The circuit breaker is open.
    CircuitOpen { notice: HaltNotice },
    /// A pre-flight check reported an error.
    HealthCheckFailed { summary: String },
    /// No calls left and waiting was disabled, or the agent hit its API limit.
    RateLimited {
        cause: RateLimitCause,
        reset_in_secs: u64,
    },
    /// Ctrl-C.
    Interrupted,
    /// `max_loops` iterations ran without finishing.
    MaxLoops { limit: u32 },
}

impl LoopStop {
    /// Machine-readable reason, persisted in `run_state.json`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LoopStop::Complete { reason } => reason.as_str(),
            LoopStop::CircuitOpen { notice } => notice.reason.as_str(),
            LoopStop::HealthCheckFailed { .. } => "health_check_failed",
            LoopStop::RateLimited {
                cause: RateLimitCause::Budget,
                ..
            } => "rate_limited",
            LoopStop::RateLimited {
                cause: RateLimitCause::ApiLimit,
                ..
            } => "api_limit",
            LoopStop::Interrupted => "interrupted",
            LoopStop::MaxLoops { .. } => "max_loops",
        }
    }

    pub fn state(&self) -> LoopState {
        match self {
            LoopStop::Complete { .. } => LoopState::ExitedComplete,
            LoopStop::CircuitOpen { .. } => LoopState::HaltedCircuitOpen,
            LoopStop::HealthCheckFailed { .. } => LoopState::HaltedHealthCheck,
            LoopStop::RateLimited { .. } => LoopState::HaltedRateLimit,
            LoopStop::Interrupted => LoopState::ExitedUser,
            LoopStop::MaxLoops { .. } => LoopState::HaltedMaxLoops,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            LoopStop::Complete { .. } => exit_codes::OK,
            LoopStop::CircuitOpen { .. } => exit_codes::CIRCUIT_OPEN,
            LoopStop::HealthCheckFailed { .. } => exit_codes::HEALTH_CHECK_FAILED,
            LoopStop::RateLimited { .. } => exit_codes::RATE_LIMITED,
            LoopStop::Interrupted => exit_codes::INTERRUPTED,
            LoopStop::MaxLoops { .. } => exit_codes::MAX_LOOPS,
        }
    }

    /// Human-readable detail for the stop line.
    pub fn message(&self) -> String {
        match self {
            LoopStop::Complete { reason } => format!("work complete ({reason})"),
            LoopStop::CircuitOpen { notice } => {
                format!("circuit breaker open: {}", notice.message)
            }
            LoopStop::HealthCheckFailed { summary } => format!("health check failed: {summary}"),
            LoopStop::RateLimited {
                cause: RateLimitCause::Budget,
                reset_in_secs,
            } => format!("hourly call budget exhausted; resets in {reset_in_secs}s"),
            LoopStop::RateLimited {
                cause: RateLimitCause::ApiLimit,
                ..
            } => "agent reported its API usage limit".to_string(),
            LoopStop::Interrupted => "interrupted".to_string(),
            LoopStop::MaxLoops { limit } => format!("reached --max-loops {limit}"),
        }
    }

    /// Recovery hint for halts; `None` for a normal exit.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            LoopStop::Complete { .. } => None,
            LoopStop::CircuitOpen { notice } => Some(notice.suggestion.clone()),
            LoopStop::HealthCheckFailed { .. } => {
                Some("Fix the reported problem and rerun `autoloop run`.".to_string())
            }
            LoopStop::RateLimited {
                cause: RateLimitCause::Budget,
                ..
            } => Some("Wait for the hourly window to reset, or raise MAX_CALLS_PER_HOUR.".to_string()),
            LoopStop::RateLimited {
                cause: RateLimitCause::ApiLimit,
                ..
            } => Some("Wait for the provider limit to reset before rerunning.".to_string()),
            LoopStop::Interrupted => Some("Rerun `autoloop run` to continue.".to_string()),
            LoopStop::MaxLoops { .. } => {
                Some("Rerun `autoloop run` to continue where the loop stopped.".to_string())
            }
        }
    }

    /// Session discarded when the run stops this way.
    fn session_reset(&self) -> Option<SessionResetReason> {
        match self {
            LoopStop::Complete { .. } => Some(SessionResetReason::ProjectComplete),
            LoopStop::CircuitOpen { .. } => Some(SessionResetReason::CircuitOpen),
            LoopStop::Interrupted => Some(SessionResetReason::Interrupted),
            _ => None,
        }
    }
}

/// Knobs that come from the command line rather than `.autolooprc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    pub max_loops: Option<u32>,
    /// Sleep until the hourly window resets instead of halting.
    pub wait_on_rate_limit: bool,
    /// Interval between countdown events while waiting.
    pub countdown_tick: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_loops: None,
            wait_on_rate_limit: true,
            countdown_tick: Duration::from_secs(60),
        }
    }
}

/// Progress reported to the caller while the loop runs.
#[derive(Debug, Clone, Copy)]
pub enum LoopEvent<'a> {
    Step(&'a StepOutcome),
    Health(&'a HealthReport),
    /// Waiting for the rate-limit window; emitted once per tick.
    Waiting { remaining: Duration },
    /// Backing off after a failed invocation.
    Retrying { delay: Duration },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub loops_executed: u32,
    pub stop: LoopStop,
}

/// Run iterations until the exit gate, the circuit breaker, the rate limiter,
/// a health check, the loop limit, or an interrupt stops the loop.
///
/// Errors are reserved for state that cannot be read or written.
pub fn run_loop<E, F>(
    root: &Path,
    config: LoopConfig,
    executor: &E,
    locator: &dyn ToolLocator,
    cancel: &CancelToken,
    options: &LoopOptions,
    mut on_event: F,
) -> Result<LoopOutcome>
where
    E: Executor + ?Sized,
    F: FnMut(LoopEvent<'_>),
{
    let mut runtime = LoopRuntime::start(ProjectPaths::new(root), config, Utc::now())?;
    let agent_program = executor.program();
    let mut loops_executed = 0u32;

    let stop = loop {
        if cancel.is_cancelled() {
            break LoopStop::Interrupted;
        }
        if let Some(limit) = options.max_loops
            && loops_executed >= limit
        {
            break LoopStop::MaxLoops { limit };
        }
        if let Some(notice) = runtime.circuit.should_halt() {
            break LoopStop::CircuitOpen { notice };
        }

        let now = Utc::now();
        if runtime.limiter.is_exhausted(now)? {
            let reset_in_secs = runtime.limiter.seconds_until_reset(now);
            if !options.wait_on_rate_limit {
                break LoopStop::RateLimited {
                    cause: RateLimitCause::Budget,
                    reset_in_secs,
                };
            }
            info!(reset_in_secs, "call budget exhausted; waiting for the window to reset");
            runtime.set_state(LoopState::PausedRateLimit, now)?;
            let waited = cancel.wait_with_countdown(
                Duration::from_secs(reset_in_secs),
                options.countdown_tick,
                |remaining| on_event(LoopEvent::Waiting { remaining }),
            );
            if waited == WaitOutcome::Cancelled {
                break LoopStop::Interrupted;
            }
            runtime.set_state(LoopState::Running, Utc::now())?;
            continue;
        }

        let report = run_health_checks(
            &HealthInput {
                paths: &runtime.paths,
                config: &runtime.config,
                agent_program: agent_program.as_deref(),
                rate_remaining: runtime.limiter.remaining(now)?,
            },
            locator,
        );
        on_event(LoopEvent::Health(&report));
        if let Some(summary) = report.summary() {
            break LoopStop::HealthCheckFailed { summary };
        }

        let outcome = run_step(&mut runtime, executor, cancel)?;
        loops_executed += 1;
        on_event(LoopEvent::Step(&outcome));

        if outcome.cancelled || cancel.is_cancelled() {
            break LoopStop::Interrupted;
        }
        match outcome.decision {
            GateDecision::Halt(reason) => {
                let notice = runtime
                    .circuit
                    .should_halt()
                    .unwrap_or_else(|| fallback_notice(reason));
                break LoopStop::CircuitOpen { notice };
            }
            GateDecision::Exit(reason) => break LoopStop::Complete { reason },
            GateDecision::Continue => {}
        }
        if outcome.record.api_limit_reached {
            break LoopStop::RateLimited {
                cause: RateLimitCause::ApiLimit,
                reset_in_secs: runtime.limiter.seconds_until_reset(Utc::now()),
            };
        }
        if outcome.failed {
            let delay = runtime.config.retry_delay();
            if !delay.is_zero() {
                on_event(LoopEvent::Retrying { delay });
                if cancel.wait(delay) == WaitOutcome::Cancelled {
                    break LoopStop::Interrupted;
                }
            }
        }
    };

    finish(&mut runtime, &stop)?;
    Ok(LoopOutcome {
        run_id: runtime.run_id,
        loops_executed,
        stop,
    })
}

fn finish(runtime: &mut LoopRuntime, stop: &LoopStop) -> Result<()> {
    let now = Utc::now();
    runtime.run_state.reason = Some(stop.reason_code().to_string());
    runtime.run_state.suggestion = stop.suggestion();
    runtime.set_state(stop.state(), now)?;

    if let Some(reason) = stop.session_reset() {
        runtime.sessions.reset(reason, now)?;
    }

    match stop {
        LoopStop::Complete { .. } => info!(reason = stop.reason_code(), "{}", stop.message()),
        _ => warn!(
            reason = stop.reason_code(),
            suggestion = ?runtime.run_state.suggestion,
            "{}",
            stop.message()
        ),
    }
    Ok(())
}

fn fallback_notice(reason: HaltReason) -> HaltNotice {
    HaltNotice {
        reason,
        message: format!("circuit breaker opened ({reason})"),
        suggestion: reason.suggestion().to_string(),
    }
}
