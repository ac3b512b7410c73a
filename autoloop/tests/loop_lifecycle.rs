//! Loop-level harness tests for full controller lifecycle scenarios.
//!
//! These tests drive `run_loop` through multiple iterations with a scripted
//! agent and verify the persisted circuit, session, and run state.

use std::fs;
use std::time::Duration;

use autoloop::core::rate_limit::RateLimitCounters;
use autoloop::core::session::SessionDiagnosis;
use autoloop::core::types::{CircuitState, ExitReason, HaltReason, LoopState};
use autoloop::exit_codes;
use autoloop::io::cancel::CancelToken;
use autoloop::io::circuit_store::CircuitStore;
use autoloop::io::config::LoopConfig;
use autoloop::io::iteration_log::IterationPaths;
use autoloop::io::rate_store::TrackedRateLimiter;
use autoloop::io::run_state::load_run_state;
use autoloop::io::session_store::{SessionResetReason, SessionStore};
use autoloop::looping::{LoopEvent, LoopOptions, LoopOutcome, LoopStop, run_loop};
use autoloop::test_support::{AllTools, ScriptedExecutor, ScriptedRun, TestProject};

fn drive(project: &TestProject, config: LoopConfig, executor: &ScriptedExecutor) -> LoopOutcome {
    run_loop(
        project.root(),
        config,
        executor,
        &AllTools,
        &CancelToken::new(),
        &LoopOptions::default(),
        |_| {},
    )
    .expect("loop")
}

/// Seed an exhausted budget whose window started `age_secs` ago.
fn exhaust_budget(project: &TestProject, calls: u32, age_secs: i64) {
    let paths = project.paths();
    fs::create_dir_all(&paths.state_dir).expect("mkdir");
    let counters = RateLimitCounters {
        call_count: calls,
        window_start: chrono::Utc::now().timestamp() - age_secs,
        ..RateLimitCounters::default()
    };
    fs::write(
        &paths.rate_limit,
        serde_json::to_string(&counters).expect("serialize"),
    )
    .expect("write counters");
}

const DONE_TEXT: &str = "All tasks are complete. Nothing left to do.\n\
---LOOP_STATUS---\n\
STATUS: COMPLETE\n\
TASKS_COMPLETED_THIS_LOOP: 1\n\
FILES_MODIFIED: 0\n\
EXIT_SIGNAL: true\n\
---END_LOOP_STATUS---\n";

/// Three idle iterations: CLOSED -> HALF_OPEN after the second, OPEN after
/// the third, and the loop halts with reason `no_progress`.
#[test]
fn no_progress_trips_the_breaker() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![
        ScriptedRun::text("Looking around the codebase."),
        ScriptedRun::text("Still reading files."),
        ScriptedRun::text("Thinking about the design."),
        ScriptedRun::text("never reached"),
    ]);

    let mut circuits = Vec::new();
    let outcome = run_loop(
        project.root(),
        project.config(),
        &executor,
        &AllTools,
        &CancelToken::new(),
        &LoopOptions::default(),
        |event| {
            if let LoopEvent::Step(step) = event {
                circuits.push(step.circuit);
            }
        },
    )
    .expect("loop");

    assert_eq!(
        circuits,
        vec![CircuitState::Closed, CircuitState::HalfOpen, CircuitState::Open]
    );
    assert_eq!(outcome.loops_executed, 3);
    assert_eq!(executor.remaining(), 1);
    let LoopStop::CircuitOpen { notice } = &outcome.stop else {
        panic!("unexpected stop: {:?}", outcome.stop);
    };
    assert_eq!(notice.reason, HaltReason::NoProgress);
    assert_eq!(outcome.stop.reason_code(), "no_progress");
    assert_eq!(outcome.stop.exit_code(), exit_codes::CIRCUIT_OPEN);

    let store = CircuitStore::new(&project.paths());
    let history = store.history();
    let tos: Vec<CircuitState> = history.iter().map(|t| t.to).collect();
    assert_eq!(tos, vec![CircuitState::HalfOpen, CircuitState::Open]);

    let state = load_run_state(&project.paths().run_state);
    assert_eq!(state.state, LoopState::HaltedCircuitOpen);
    assert_eq!(state.reason.as_deref(), Some("no_progress"));
    assert!(state.suggestion.is_some());
}

/// A rerun with the breaker still open makes no calls.
#[test]
fn open_breaker_survives_restart_until_reset() {
    let project = TestProject::new().expect("project");
    let idle = ScriptedExecutor::new(vec![ScriptedRun::text("hmm"); 3]);
    let first = drive(&project, project.config(), &idle);
    assert!(matches!(first.stop, LoopStop::CircuitOpen { .. }));

    let executor = ScriptedExecutor::new(vec![ScriptedRun::text("unused")]);
    let second = drive(&project, project.config(), &executor);
    assert_eq!(second.loops_executed, 0);
    assert!(matches!(second.stop, LoopStop::CircuitOpen { .. }));

    autoloop::reset::reset_circuit(project.root(), "manual reset", chrono::Utc::now())
        .expect("reset");
    let executor = ScriptedExecutor::new(vec![ScriptedRun::text(DONE_TEXT)]);
    let third = drive(&project, project.config(), &executor);
    assert_eq!(third.loops_executed, 1);
    assert_eq!(
        third.stop,
        LoopStop::Complete {
            reason: ExitReason::ProjectComplete
        }
    );
}

/// Exit needs both the agent's EXIT_SIGNAL and enough completion phrases.
#[test]
fn dual_condition_gate_ignores_bare_completion_talk() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![
        // Completion phrases without EXIT_SIGNAL: keep going.
        ScriptedRun::text(
            "The parser implementation is complete. All tasks are done for the parser.\n\
             ---LOOP_STATUS---\nSTATUS: IN_PROGRESS\nEXIT_SIGNAL: false\n---END_LOOP_STATUS---\n",
        )
        .writes("src/parser.rs", "fn parse() {}\n"),
        ScriptedRun::text(DONE_TEXT),
    ]);

    let outcome = drive(&project, project.config(), &executor);

    assert_eq!(outcome.loops_executed, 2);
    assert_eq!(
        outcome.stop,
        LoopStop::Complete {
            reason: ExitReason::ProjectComplete
        }
    );
    assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
    let state = load_run_state(&project.paths().run_state);
    assert_eq!(state.state, LoopState::ExitedComplete);
    assert_eq!(state.reason.as_deref(), Some("project_complete"));
    assert_eq!(state.suggestion, None);
}

/// A fully checked fix plan ends the loop even without an exit signal.
#[test]
fn checked_fix_plan_completes() {
    let project = TestProject::new().expect("project");
    project
        .write_fix_plan("- [x] parser\n- [ ] executor\n")
        .expect("plan");
    let plan_path = project.paths().resolve(&LoopConfig::default().fix_plan_file);
    let executor = ScriptedExecutor::new(vec![
        ScriptedRun::text("Implemented the executor.")
            .writes("src/executor.rs", "fn exec() {}\n")
            .writes(
                plan_path.to_str().expect("utf-8 path"),
                "- [x] parser\n- [x] executor\n",
            ),
    ]);

    let outcome = drive(&project, project.config(), &executor);

    assert_eq!(
        outcome.stop,
        LoopStop::Complete {
            reason: ExitReason::PlanComplete
        }
    );
    let prompts = executor.prompts();
    assert!(prompts[0].contains("- [ ] executor"));
}

/// Completion resets the session so the next run starts fresh.
#[test]
fn completion_discards_the_session() {
    let project = TestProject::new().expect("project");
    let done_json = serde_json::json!({
        "type": "result",
        "session_id": "sess-77",
        "result": DONE_TEXT,
    })
    .to_string();
    let executor = ScriptedExecutor::new(vec![
        ScriptedRun::json_result("Set up the module layout.", Some("sess-77"))
            .writes("src/lib.rs", "pub mod a;\n"),
        ScriptedRun::text(&done_json),
    ]);

    let outcome = drive(&project, project.config(), &executor);

    assert!(matches!(outcome.stop, LoopStop::Complete { .. }));
    assert_eq!(
        executor.resumed_sessions(),
        vec![None, Some("sess-77".to_string())]
    );
    let sessions = SessionStore::new(&project.paths());
    assert_eq!(
        sessions.diagnose(chrono::Utc::now(), 24).code,
        SessionDiagnosis::NoSessionFile
    );
    assert_eq!(
        sessions.history().last().and_then(|e| e.reason),
        Some(SessionResetReason::ProjectComplete)
    );
}

/// Repeated failures trip the breaker on the same-error threshold.
#[test]
fn repeated_failures_open_on_same_error() {
    let project = TestProject::new().expect("project");
    let config = LoopConfig {
        cb_no_progress_threshold: 10,
        cb_same_error_threshold: 2,
        ..project.config()
    };
    let executor = ScriptedExecutor::new(vec![
        ScriptedRun::failure(1, "Error: build failed\n"),
        ScriptedRun::timeout(),
    ]);

    let outcome = drive(&project, config, &executor);

    assert_eq!(outcome.loops_executed, 2);
    let LoopStop::CircuitOpen { notice } = outcome.stop else {
        panic!("expected circuit open");
    };
    assert_eq!(notice.reason, HaltReason::SameError);

    let meta: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(IterationPaths::new(&project.paths(), 2).meta_path).expect("read"),
    )
    .expect("parse");
    assert_eq!(meta["timed_out"], true);
    assert_eq!(meta["circuit_after"], "OPEN");
    assert_eq!(meta["decision"], "halt:same_error");
}

/// Permission denials open the breaker after the configured count.
#[test]
fn permission_denials_halt() {
    let project = TestProject::new().expect("project");
    let denied = serde_json::json!({
        "type": "result",
        "result": "I could not run the tests.",
        "permission_denials": [{"tool_name": "Bash"}],
    })
    .to_string();
    let executor = ScriptedExecutor::new(vec![
        ScriptedRun::text(&denied).writes("a.txt", "a\n"),
        ScriptedRun::text(&denied).writes("b.txt", "b\n"),
    ]);

    let outcome = drive(&project, project.config(), &executor);

    assert_eq!(outcome.stop.reason_code(), "permission_denied");
    assert_eq!(outcome.loops_executed, 2);
}

/// Loop numbers continue across runs.
#[test]
fn loop_numbers_continue_across_runs() {
    let project = TestProject::new().expect("project");
    let options = LoopOptions {
        max_loops: Some(1),
        ..LoopOptions::default()
    };
    for (i, file) in ["a.txt", "b.txt"].iter().enumerate() {
        let executor = ScriptedExecutor::new(vec![ScriptedRun::text("progress").writes(file, "x\n")]);
        let outcome = run_loop(
            project.root(),
            project.config(),
            &executor,
            &AllTools,
            &CancelToken::new(),
            &options,
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxLoops { limit: 1 });
        assert_eq!(
            load_run_state(&project.paths().run_state).loop_count,
            i as u32 + 1
        );
    }
    assert!(IterationPaths::new(&project.paths(), 2).meta_path.is_file());
}

/// A malformed `.autolooprc` blocks the loop before any call.
#[test]
fn invalid_config_file_fails_health_check() {
    let project = TestProject::new().expect("project");
    project.write_config("MAX_CALLS_PER_HOUR=0\n").expect("config");
    let executor = ScriptedExecutor::new(vec![ScriptedRun::text("unused")]);

    let outcome = drive(&project, project.config(), &executor);

    let LoopStop::HealthCheckFailed { summary } = &outcome.stop else {
        panic!("unexpected stop: {:?}", outcome.stop);
    };
    assert!(summary.starts_with("config:"), "{summary}");
    assert_eq!(executor.remaining(), 1);
    assert_eq!(
        load_run_state(&project.paths().run_state).state,
        LoopState::HaltedHealthCheck
    );
}

/// An exhausted budget pauses until the window rolls over, then resumes.
#[test]
fn exhausted_budget_waits_for_window_reset() {
    let project = TestProject::new().expect("project");
    exhaust_budget(&project, 2, 3598);
    let config = LoopConfig {
        max_calls_per_hour: 2,
        ..project.config()
    };
    let executor = ScriptedExecutor::new(vec![ScriptedRun::text(DONE_TEXT)]);
    let options = LoopOptions {
        countdown_tick: Duration::from_millis(200),
        ..LoopOptions::default()
    };
    let run_state = project.paths().run_state;

    let mut ticks = 0;
    let mut paused_states = Vec::new();
    let outcome = run_loop(
        project.root(),
        config,
        &executor,
        &AllTools,
        &CancelToken::new(),
        &options,
        |event| {
            if let LoopEvent::Waiting { remaining } = event {
                assert!(remaining <= Duration::from_secs(2));
                ticks += 1;
                paused_states.push(load_run_state(&run_state).state);
            }
        },
    )
    .expect("loop");

    assert!(ticks >= 2, "expected countdown ticks, got {ticks}");
    assert!(
        paused_states
            .iter()
            .all(|state| *state == LoopState::PausedRateLimit)
    );
    assert_eq!(outcome.loops_executed, 1);
    assert_eq!(executor.remaining(), 0);
    assert_eq!(
        outcome.stop,
        LoopStop::Complete {
            reason: ExitReason::ProjectComplete
        }
    );
    let limiter = TrackedRateLimiter::load(&project.paths(), 2);
    assert_eq!(limiter.counters().call_count, 1);
}

/// Ctrl-C during the rate-limit wait stops the loop as an interrupt.
#[test]
fn interrupt_during_rate_limit_wait() {
    let project = TestProject::new().expect("project");
    exhaust_budget(&project, 2, 10);
    let config = LoopConfig {
        max_calls_per_hour: 2,
        ..project.config()
    };
    let executor = ScriptedExecutor::new(vec![ScriptedRun::text("unused")]);
    let cancel = CancelToken::new();
    let options = LoopOptions {
        countdown_tick: Duration::from_millis(50),
        ..LoopOptions::default()
    };

    let mut ticks = 0;
    let outcome = run_loop(
        project.root(),
        config,
        &executor,
        &AllTools,
        &cancel,
        &options,
        |event| {
            if let LoopEvent::Waiting { .. } = event {
                ticks += 1;
                if ticks == 2 {
                    cancel.cancel();
                }
            }
        },
    )
    .expect("loop");

    assert_eq!(ticks, 2);
    assert_eq!(outcome.loops_executed, 0);
    assert_eq!(executor.remaining(), 1);
    assert_eq!(outcome.stop, LoopStop::Interrupted);
    assert_eq!(outcome.stop.exit_code(), exit_codes::INTERRUPTED);
    let state = load_run_state(&project.paths().run_state);
    assert_eq!(state.state, LoopState::ExitedUser);
    assert_eq!(state.reason.as_deref(), Some("interrupted"));
}
