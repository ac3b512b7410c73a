//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples loop orchestration from the actual agent
//! backend (a Claude-style CLI by default). Tests use scripted executors that
//! return predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::OutputFormat;
use crate::io::cancel::CancelToken;
use crate::io::process::{CommandOutput, CommandSpec, run_command};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the project root).
    pub workdir: PathBuf,
    /// Prompt text, supplied on stdin.
    pub prompt: String,
    pub format: OutputFormat,
    pub allowed_tools: Vec<String>,
    /// Session to resume, if any.
    pub resume_session: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Where to write the combined stdout/stderr log.
    pub log_path: PathBuf,
    /// Where to stream stdout lines while the agent runs.
    pub stream_path: Option<PathBuf>,
}

/// Captured result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl AgentRun {
    /// Timeout, cancellation, or non-zero exit. Stdout content is irrelevant.
    pub fn failed(&self) -> bool {
        self.timed_out || self.cancelled || self.exit_code != Some(0)
    }
}

impl From<CommandOutput> for AgentRun {
    fn from(output: CommandOutput) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            elapsed: output.elapsed,
        }
    }
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Program looked up on PATH by the health check, if any.
    fn program(&self) -> Option<String>;

    /// Run the agent. Timeouts and non-zero exits are reported in the
    /// returned [`AgentRun`]; `Err` means the agent could not be run at all.
    fn exec(&self, request: &AgentRequest, cancel: &CancelToken) -> Result<AgentRun>;
}

/// Executor that spawns the configured agent CLI.
#[derive(Debug, Clone)]
pub struct AgentExecutor {
    program: String,
    extra_args: Vec<String>,
}

impl AgentExecutor {
    /// `command` is the program optionally followed by whitespace-separated
    /// arguments that precede the generated ones.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("agent command must not be empty"))?;
        Ok(Self {
            program,
            extra_args: parts.collect(),
        })
    }
}

impl Executor for AgentExecutor {
    fn program(&self) -> Option<String> {
        Some(self.program.clone())
    }

    #[instrument(skip_all, fields(program = %self.program, timeout_secs = request.timeout.as_secs(), resume = request.resume_session.is_some()))]
    fn exec(&self, request: &AgentRequest, cancel: &CancelToken) -> Result<AgentRun> {
        info!(workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .args(build_agent_args(request))
            .current_dir(&request.workdir);

        let output = run_command(
            cmd,
            &CommandSpec {
                stdin: Some(request.prompt.as_bytes()),
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                stream_path: request.stream_path.as_deref(),
                cancel: Some(cancel),
            },
        )
        .with_context(|| format!("run agent {}", self.program))?;

        write_executor_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if output.cancelled {
            warn!("agent interrupted");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
        } else {
            debug!(elapsed_ms = output.elapsed.as_millis() as u64, "agent completed");
        }
        Ok(output.into())
    }
}

/// Arguments appended after the program for one request.
pub fn build_agent_args(request: &AgentRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string()];
    if request.format == OutputFormat::Json {
        args.push("--output-format".to_string());
        args.push("json".to_string());
    }
    if !request.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.extend(request.allowed_tools.iter().cloned());
    }
    if let Some(session) = &request.resume_session {
        args.push("--resume".to_string());
        args.push(session.clone());
    }
    args
}

/// Write the combined stdout/stderr log for one invocation.
pub fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("agent"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("agent"));
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[agent interrupted]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &Path) -> AgentRequest {
        AgentRequest {
            workdir: temp.to_path_buf(),
            prompt: "do the next task".to_string(),
            format: OutputFormat::Json,
            allowed_tools: vec!["Write".to_string(), "Bash(git *)".to_string()],
            resume_session: None,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            log_path: temp.join("agent.log"),
            stream_path: None,
        }
    }

    #[test]
    fn args_for_json_with_resume() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.resume_session = Some("sess-1".to_string());
        assert_eq!(
            build_agent_args(&req),
            vec![
                "-p",
                "--output-format",
                "json",
                "--allowedTools",
                "Write",
                "Bash(git *)",
                "--resume",
                "sess-1"
            ]
        );
    }

    #[test]
    fn args_for_text_without_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.format = OutputFormat::Text;
        req.allowed_tools.clear();
        assert_eq!(build_agent_args(&req), vec!["-p"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(AgentExecutor::new("   ").is_err());
        let exec = AgentExecutor::new("claude --verbose").expect("executor");
        assert_eq!(exec.program().as_deref(), Some("claude"));
    }

    #[cfg(unix)]
    #[test]
    fn runs_program_with_prompt_on_stdin_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("agent.sh");
        fs::write(&script, "#!/bin/sh\necho \"args: $*\"\ncat\nexit 2\n").expect("script");
        let exec = AgentExecutor::new(&format!("sh {}", script.display())).expect("executor");
        let mut req = request(temp.path());
        req.allowed_tools.clear();

        let run = exec.exec(&req, &CancelToken::new()).expect("exec");
        let stdout = String::from_utf8_lossy(&run.stdout);
        assert!(stdout.contains("args: -p --output-format json"));
        assert!(stdout.contains("do the next task"));
        assert_eq!(run.exit_code, Some(2));
        assert!(run.failed());

        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.starts_with("=== stdout ===\n"));
        assert!(log.contains("=== stderr ==="));
    }

    #[test]
    fn failed_covers_every_failure_kind() {
        let ok = AgentRun {
            exit_code: Some(0),
            ..AgentRun::default()
        };
        assert!(!ok.failed());
        assert!(AgentRun::default().failed());
        assert!(
            AgentRun {
                timed_out: true,
                ..ok.clone()
            }
            .failed()
        );
    }
}
