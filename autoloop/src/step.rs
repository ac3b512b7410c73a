//! Orchestration for a single loop iteration.
//!
//! One call to [`run_step`] builds the prompt, invokes the agent once, measures
//! the git diff, analyzes the output, and feeds the resulting record through the
//! circuit breaker and the exit gate. All state touched by the iteration is
//! persisted before it returns.

use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::analyzer::{AnalyzerInput, analyze_with_trace};
use crate::core::circuit::{CircuitBreakerState, Transition};
use crate::core::exit_gate::{GateDecision, GateInput, evaluate};
use crate::core::plan::count_tasks;
use crate::core::types::{CircuitState, LoopRecord, LoopState};
use crate::io::cancel::CancelToken;
use crate::io::circuit_store::CircuitStore;
use crate::io::config::LoopConfig;
use crate::io::executor::{AgentRequest, AgentRun, Executor};
use crate::io::git::{Git, Snapshot};
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_iteration};
use crate::io::loop_history::LoopHistory;
use crate::io::paths::ProjectPaths;
use crate::io::prompt::{LoopContext, build_prompt, read_optional};
use crate::io::rate_store::TrackedRateLimiter;
use crate::io::run_state::{RunState, load_run_state, write_run_state};
use crate::io::session_store::SessionStore;

/// State carried across the iterations of one run.
#[derive(Debug)]
pub struct LoopRuntime {
    pub paths: ProjectPaths,
    pub config: LoopConfig,
    pub run_id: String,
    pub circuit_store: CircuitStore,
    pub circuit: CircuitBreakerState,
    pub sessions: SessionStore,
    pub limiter: TrackedRateLimiter,
    pub history: LoopHistory,
    pub run_state: RunState,
}

impl LoopRuntime {
    /// Load persisted state and start a new run.
    ///
    /// Circuit, rate-limit, and session state carry over from earlier runs;
    /// the exit-gate history starts empty.
    pub fn start(paths: ProjectPaths, config: LoopConfig, now: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("create {}", paths.state_dir.display()))?;
        let circuit_store = CircuitStore::new(&paths);
        let circuit = circuit_store.load();
        let sessions = SessionStore::new(&paths);
        let mut limiter = TrackedRateLimiter::load(&paths, config.max_calls_per_hour);
        limiter.refresh(now)?;
        let history = LoopHistory::fresh(&paths.loop_history)?;

        let previous = load_run_state(&paths.run_state);
        let run_id = format!("run-{}", now.format("%Y%m%dT%H%M%SZ"));
        let run_state = RunState {
            run_id: Some(run_id.clone()),
            state: LoopState::Running,
            loop_count: previous.loop_count,
            calls_this_run: 0,
            reason: None,
            suggestion: None,
            started_at: Some(now),
            updated_at: Some(now),
            last_record: previous.last_record,
        };
        write_run_state(&paths.run_state, &run_state)?;
        info!(%run_id, circuit = %circuit.state, next_loop = run_state.next_loop(), "run started");

        Ok(Self {
            paths,
            config,
            run_id,
            circuit_store,
            circuit,
            sessions,
            limiter,
            history,
            run_state,
        })
    }

    /// Persist the run state with a new controller state.
    pub fn set_state(&mut self, state: LoopState, now: DateTime<Utc>) -> Result<()> {
        self.run_state.state = state;
        self.run_state.updated_at = Some(now);
        write_run_state(&self.paths.run_state, &self.run_state)
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub loop_number: u32,
    pub record: LoopRecord,
    pub decision: GateDecision,
    pub transition: Option<Transition>,
    pub circuit: CircuitState,
    /// Timeout, non-zero exit, or spawn failure.
    pub failed: bool,
    /// The agent was killed by an interrupt; the record was not fed to the breaker.
    pub cancelled: bool,
}

/// Execute one iteration end to end.
#[instrument(skip_all, fields(run_id = %runtime.run_id, loop_number = runtime.run_state.next_loop()))]
pub fn run_step<E: Executor + ?Sized>(
    runtime: &mut LoopRuntime,
    executor: &E,
    cancel: &CancelToken,
) -> Result<StepOutcome> {
    let started_at = Utc::now();
    let loop_number = runtime.run_state.next_loop();
    runtime.run_state.loop_count = loop_number;
    let circuit_before = runtime.circuit.state;
    let iteration_paths = IterationPaths::new(&runtime.paths, loop_number);

    let resume_session = if runtime.config.session_continuity {
        runtime
            .sessions
            .resolve(started_at, runtime.config.session_expiry_hours)?
            .resumable_id()
            .map(str::to_string)
    } else {
        None
    };

    let prompt = assemble_prompt(runtime, loop_number, resume_session.is_some())?;
    let git = Git::new(&runtime.paths.root);
    let before = snapshot_or_empty(&git);

    runtime.limiter.record_call(started_at)?;
    runtime.run_state.calls_this_run += 1;

    let request = AgentRequest {
        workdir: runtime.paths.root.clone(),
        prompt,
        format: runtime.config.output_format,
        allowed_tools: runtime.config.allowed_tools_list(),
        resume_session: resume_session.clone(),
        timeout: runtime.config.timeout(),
        output_limit_bytes: runtime.config.output_limit_bytes,
        log_path: iteration_paths.agent_log_path.clone(),
        stream_path: Some(iteration_paths.stream_path.clone()),
    };
    let run = match executor.exec(&request, cancel) {
        Ok(run) => run,
        Err(err) => {
            // Spawn failures count as a failed iteration, not a crash.
            error!(err = %format!("{err:#}"), "agent invocation failed");
            AgentRun {
                stderr: format!("Error: {err:#}\n").into_bytes(),
                ..AgentRun::default()
            }
        }
    };

    let after = snapshot_or_empty(&git);
    let files_changed = git.count_changes(&before, &after);
    let failed = run.failed();

    let analysis = analyze_with_trace(&AnalyzerInput {
        loop_number,
        stdout: &run.stdout,
        stderr: &run.stderr,
        format: runtime.config.output_format,
        files_changed,
        failed,
    });
    for (strategy, failure) in &analysis.failures {
        debug!(strategy = strategy.as_str(), %failure, "parse strategy failed");
    }
    let record = analysis.record.clone();
    let now = Utc::now();

    let mut transition = None;
    let decision = if run.cancelled {
        warn!(loop_number, "iteration interrupted; record not counted");
        GateDecision::Continue
    } else {
        let update = runtime.circuit.record(&record, &runtime.config.circuit_thresholds(), now);
        if update.output_declined {
            warn!(
                loop_number,
                output_length = record.output_length,
                "output length dropped sharply without progress"
            );
        }
        if let Some(t) = &update.transition {
            runtime.circuit_store.append_transition(t)?;
        }
        transition = update.transition;
        runtime.circuit_store.save(&runtime.circuit)?;

        if runtime.config.session_continuity
            && let Some(session_id) = &record.session_id
        {
            runtime.sessions.save(session_id, now)?;
        }

        runtime.history.push(record.clone())?;
        let tasks = read_optional(&runtime.paths.resolve(&runtime.config.fix_plan_file))?
            .map(|plan| count_tasks(&plan));
        evaluate(
            &GateInput {
                history: runtime.history.records(),
                tasks,
                circuit: runtime.circuit.state,
                halt_reason: runtime.circuit.halt_reason,
            },
            &runtime.config.gate_config(),
        )
    };

    let meta = IterationMeta {
        run_id: runtime.run_id.clone(),
        loop_number,
        started_at,
        ended_at: now,
        duration_ms: run.elapsed.as_millis() as u64,
        exit_code: run.exit_code,
        timed_out: run.timed_out,
        cancelled: run.cancelled,
        resumed_session: resume_session,
        parsed_by: analysis.parsed_by.map(|s| s.as_str().to_string()),
        parse_failures: analysis
            .failures
            .iter()
            .map(|(strategy, failure)| format!("{}: {failure}", strategy.as_str()))
            .collect(),
        first_error: analysis.first_error.clone(),
        circuit_before,
        circuit_after: runtime.circuit.state,
        decision: decision_label(decision),
    };
    write_iteration(&iteration_paths, &meta, &record)?;

    runtime.run_state.last_record = Some(record.clone());
    runtime.run_state.updated_at = Some(now);
    write_run_state(&runtime.paths.run_state, &runtime.run_state)?;

    info!(
        loop_number,
        files_changed = record.files_changed,
        has_errors = record.has_errors,
        exit_signal = record.exit_signal,
        completion_indicators = record.completion_indicators,
        circuit = %runtime.circuit.state,
        decision = %meta.decision,
        "iteration finished"
    );

    Ok(StepOutcome {
        loop_number,
        record,
        decision,
        transition,
        circuit: runtime.circuit.state,
        failed,
        cancelled: run.cancelled,
    })
}

fn assemble_prompt(runtime: &LoopRuntime, loop_number: u32, resumed: bool) -> Result<String> {
    let prompt_path = runtime.paths.resolve(&runtime.config.prompt_file);
    let base = fs::read_to_string(&prompt_path)
        .with_context(|| format!("read prompt {}", prompt_path.display()))?;
    let fix_plan = read_optional(&runtime.paths.resolve(&runtime.config.fix_plan_file))?;
    let calls_remaining = runtime
        .config
        .max_calls_per_hour
        .saturating_sub(runtime.limiter.counters().call_count.saturating_add(1));
    build_prompt(
        &base,
        &LoopContext {
            loop_number,
            calls_remaining,
            max_calls: runtime.config.max_calls_per_hour,
            session_resumed: resumed,
            fix_plan,
            fix_plan_file: runtime.config.fix_plan_file.display().to_string(),
            previous_summary: runtime
                .run_state
                .last_record
                .as_ref()
                .and_then(|r| r.summary.clone()),
            circuit_warning: circuit_warning(&runtime.circuit),
        },
    )
}

fn circuit_warning(circuit: &CircuitBreakerState) -> Option<String> {
    if circuit.consecutive_permission_denials > 0 {
        return Some(format!(
            "The last {} loop(s) hit permission denials. Use only the allowed tools.",
            circuit.consecutive_permission_denials
        ));
    }
    if circuit.consecutive_no_progress > 0 {
        return Some(format!(
            "No measurable progress in the last {} loop(s). Change files, or set EXIT_SIGNAL: true if the work is done.",
            circuit.consecutive_no_progress
        ));
    }
    if circuit.consecutive_same_error > 1 {
        return Some(format!(
            "The last {} loops ended with errors. Fix the failure before moving on.",
            circuit.consecutive_same_error
        ));
    }
    None
}

fn snapshot_or_empty(git: &Git) -> Snapshot {
    git.snapshot().unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "git snapshot failed; counting no file changes");
        Snapshot::default()
    })
}

fn decision_label(decision: GateDecision) -> String {
    match decision {
        GateDecision::Continue => "continue".to_string(),
        GateDecision::Exit(reason) => format!("exit:{reason}"),
        GateDecision::Halt(reason) => format!("halt:{reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExitReason, HaltReason};
    use crate::test_support::{ScriptedExecutor, ScriptedRun, TestProject};

    fn runtime(project: &TestProject) -> LoopRuntime {
        LoopRuntime::start(project.paths(), project.config(), Utc::now()).expect("start")
    }

    #[test]
    fn step_records_changes_and_persists_state() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::text("Implemented the parser.\n").writes("src/parser.rs", "fn p() {}\n"),
        ]);

        let outcome = run_step(&mut runtime, &executor, &CancelToken::new()).expect("step");

        assert_eq!(outcome.loop_number, 1);
        assert_eq!(outcome.record.files_changed, 1);
        assert_eq!(outcome.decision, GateDecision::Continue);
        assert_eq!(outcome.circuit, CircuitState::Closed);

        let iteration = IterationPaths::new(&runtime.paths, 1);
        assert!(iteration.meta_path.is_file());
        assert!(iteration.record_path.is_file());
        assert_eq!(load_run_state(&runtime.paths.run_state).loop_count, 1);
        assert_eq!(runtime.limiter.counters().call_count, 1);
    }

    #[test]
    fn prompt_carries_loop_context() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![ScriptedRun::text("ok")]);

        run_step(&mut runtime, &executor, &CancelToken::new()).expect("step");

        let prompts = executor.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("Build the project."));
        assert!(prompts[0].contains("- Loop: 1"));
    }

    #[test]
    fn dual_condition_exit_through_step() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![ScriptedRun::text(
            "All tasks complete and nothing left to do.\n\
             ---LOOP_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\n---END_LOOP_STATUS---\n",
        )]);

        let outcome = run_step(&mut runtime, &executor, &CancelToken::new()).expect("step");
        assert_eq!(
            outcome.decision,
            GateDecision::Exit(ExitReason::ProjectComplete)
        );
    }

    #[test]
    fn failed_spawn_counts_as_failed_iteration() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![ScriptedRun::spawn_error("no such file")]);

        let outcome = run_step(&mut runtime, &executor, &CancelToken::new()).expect("step");
        assert!(outcome.failed);
        assert!(outcome.record.has_errors);
        assert_eq!(runtime.circuit.consecutive_same_error, 1);
    }

    #[test]
    fn session_id_is_stored_and_resumed() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::json_result("working", Some("sess-abc")).writes("a.txt", "a\n"),
            ScriptedRun::json_result("still working", Some("sess-abc")).writes("b.txt", "b\n"),
        ]);

        run_step(&mut runtime, &executor, &CancelToken::new()).expect("first");
        run_step(&mut runtime, &executor, &CancelToken::new()).expect("second");

        let resumed = executor.resumed_sessions();
        assert_eq!(resumed, vec![None, Some("sess-abc".to_string())]);
    }

    #[test]
    fn open_circuit_halts_in_gate() {
        let project = TestProject::new().expect("project");
        let mut runtime = runtime(&project);
        let executor = ScriptedExecutor::new(vec![ScriptedRun::text("thinking"); 3]);

        let mut last = None;
        for _ in 0..3 {
            last = Some(run_step(&mut runtime, &executor, &CancelToken::new()).expect("step"));
        }
        let last = last.expect("outcome");
        assert_eq!(last.circuit, CircuitState::Open);
        assert_eq!(last.decision, GateDecision::Halt(HaltReason::NoProgress));
    }
}
