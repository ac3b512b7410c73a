//! Autonomous coding-agent loop supervisor.
//!
//! Invokes an agent CLI repeatedly against the project in `--root`, analyzing
//! each response and stopping on completion, a tripped circuit breaker, an
//! exhausted call budget, a failed health check, or Ctrl-C.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use autoloop::core::types::OutputFormat;
use autoloop::exit_codes;
use autoloop::io::cancel::CancelToken;
use autoloop::io::config::{ConfigOverrides, load_config};
use autoloop::io::executor::AgentExecutor;
use autoloop::io::health::PathLocator;
use autoloop::io::paths::ProjectPaths;
use autoloop::logging;
use autoloop::looping::{LoopEvent, LoopOptions, LoopOutcome, run_loop};
use autoloop::reset::{reset_circuit, reset_session};
use autoloop::status::{circuit_report, session_status, status_report};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Run a coding agent in a supervised loop until the work is done"
)]
struct Cli {
    /// Project directory containing `.autoloop/` and `.autolooprc`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume the loop.
    Run(RunArgs),
    /// Print run, circuit, rate-limit, and session state as JSON.
    Status,
    /// Close the circuit breaker and zero its counters.
    ResetCircuit {
        #[arg(long, default_value = "manual reset")]
        reason: String,
    },
    /// Print circuit breaker state and recent transitions as JSON.
    CircuitStatus,
    /// Discard the stored agent session.
    ResetSession,
    /// Print the session diagnosis as JSON.
    SessionStatus,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Stop after this many iterations.
    #[arg(long)]
    max_loops: Option<u32>,
    /// Halt instead of waiting when the hourly call budget runs out.
    #[arg(long)]
    no_wait: bool,
    /// Override MAX_CALLS_PER_HOUR.
    #[arg(long)]
    calls: Option<u32>,
    /// Override TIMEOUT_MINUTES.
    #[arg(long)]
    timeout: Option<u64>,
    /// Override AGENT_COMMAND.
    #[arg(long)]
    agent_command: Option<String>,
    /// Override OUTPUT_FORMAT (json|text).
    #[arg(long)]
    output_format: Option<OutputFormat>,
    /// Override ALLOWED_TOOLS.
    #[arg(long)]
    allowed_tools: Option<String>,
    /// Start a fresh agent session every iteration.
    #[arg(long)]
    no_continue: bool,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            agent_command: self.agent_command.clone(),
            output_format: self.output_format,
            allowed_tools: self.allowed_tools.clone(),
            max_calls_per_hour: self.calls,
            timeout_minutes: self.timeout,
            no_continue: self.no_continue,
        }
    }
}

/// Final line printed by `autoloop run`.
#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    loops_executed: u32,
    state: String,
    reason: &'static str,
    message: String,
    suggestion: Option<String>,
    exit_code: i32,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Run(args) => cmd_run(root, &args),
        Command::Status => print_json(&status_report(root, Utc::now())?),
        Command::ResetCircuit { reason } => print_json(&reset_circuit(root, &reason, Utc::now())?),
        Command::CircuitStatus => print_json(&circuit_report(&ProjectPaths::new(root))),
        Command::ResetSession => print_json(&reset_session(root, Utc::now())?),
        Command::SessionStatus => {
            let paths = ProjectPaths::new(root);
            let config = load_config(&paths.config)?;
            print_json(&session_status(&paths, &config, Utc::now()))
        }
    }
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let mut config = load_config(&paths.config)?;
    config.apply(&args.overrides());
    config.validate().context("invalid command-line override")?;

    let executor = AgentExecutor::new(&config.agent_command)?;
    let cancel = CancelToken::new();
    cancel.install_ctrlc_handler()?;
    let options = LoopOptions {
        max_loops: args.max_loops,
        wait_on_rate_limit: !args.no_wait,
        ..LoopOptions::default()
    };

    let outcome = run_loop(
        root,
        config,
        &executor,
        &PathLocator,
        &cancel,
        &options,
        report_event,
    )?;
    print_summary(&outcome)?;
    Ok(outcome.stop.exit_code())
}

fn report_event(event: LoopEvent<'_>) {
    match event {
        LoopEvent::Waiting { remaining } => {
            let secs = remaining.as_secs();
            eprintln!(
                "rate limit reached, resuming in {:02}:{:02} (Ctrl+C to stop)",
                secs / 60,
                secs % 60
            );
        }
        LoopEvent::Retrying { delay } => {
            eprintln!("agent call failed, retrying in {}s", delay.as_secs());
        }
        LoopEvent::Step(_) | LoopEvent::Health(_) => {}
    }
}

fn print_summary(outcome: &LoopOutcome) -> Result<()> {
    let stop = &outcome.stop;
    print_json(&RunSummary {
        run_id: &outcome.run_id,
        loops_executed: outcome.loops_executed,
        state: stop.state().to_string(),
        reason: stop.reason_code(),
        message: stop.message(),
        suggestion: stop.suggestion(),
        exit_code: stop.exit_code(),
    })?;
    Ok(())
}

/// Pretty JSON on stdout; always exits OK.
fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{payload}").context("write stdout")?;
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "autoloop",
            "--root",
            "/tmp/project",
            "run",
            "--max-loops",
            "3",
            "--no-wait",
            "--output-format",
            "text",
            "--calls",
            "20",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.max_loops, Some(3));
        assert!(args.no_wait);
        let overrides = args.overrides();
        assert_eq!(overrides.output_format, Some(OutputFormat::Text));
        assert_eq!(overrides.max_calls_per_hour, Some(20));
        assert!(!overrides.no_continue);
    }

    #[test]
    fn root_defaults_to_cwd() {
        let cli = Cli::parse_from(["autoloop", "status"]);
        assert_eq!(cli.root, PathBuf::from("."));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn reset_circuit_has_default_reason() {
        let cli = Cli::parse_from(["autoloop", "reset-circuit"]);
        assert!(matches!(
            cli.command,
            Command::ResetCircuit { reason } if reason == "manual reset"
        ));
    }

    #[test]
    fn rejects_unknown_output_format() {
        assert!(Cli::try_parse_from(["autoloop", "run", "--output-format", "xml"]).is_err());
    }
}
