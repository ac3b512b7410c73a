//! Test-only helpers: a scripted agent, a throwaway git project, and record builders.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::LoopRecord;
use crate::io::cancel::CancelToken;
use crate::io::config::LoopConfig;
use crate::io::executor::{AgentRequest, AgentRun, Executor};
use crate::io::health::ToolLocator;
use crate::io::paths::ProjectPaths;

/// One canned agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Cancel the token and report the run as interrupted.
    pub interrupt: bool,
    /// Return `Err` as if the agent could not be spawned.
    pub spawn_error: Option<String>,
    /// Files written into the workdir before returning, relative to it.
    pub writes: Vec<(String, String)>,
}

impl ScriptedRun {
    /// Successful run printing `stdout`.
    pub fn text(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// Successful run printing a JSON result object.
    pub fn json_result(result: &str, session_id: Option<&str>) -> Self {
        let mut value = serde_json::json!({
            "type": "result",
            "is_error": false,
            "result": result,
        });
        if let Some(id) = session_id {
            value["session_id"] = serde_json::Value::String(id.to_string());
        }
        Self::text(&value.to_string())
    }

    pub fn failure(exit_code: i32, stderr: &str) -> Self {
        Self {
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupt: true,
            ..Self::default()
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Also write `contents` to `path` in the workdir.
    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }
}

/// Executor that replays [`ScriptedRun`]s in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    runs: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedExecutor {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    pub fn resumed_sessions(&self) -> Vec<Option<String>> {
        self.requests()
            .into_iter()
            .map(|r| r.resume_session)
            .collect()
    }

    /// Scripted runs not yet consumed.
    pub fn remaining(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl Executor for ScriptedExecutor {
    fn program(&self) -> Option<String> {
        None
    }

    fn exec(&self, request: &AgentRequest, cancel: &CancelToken) -> Result<AgentRun> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("request log poisoned"))?
            .push(request.clone());
        let run = self
            .runs
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left"))?;

        if let Some(message) = run.spawn_error {
            bail!("{message}");
        }
        for (path, contents) in &run.writes {
            let path = request.workdir.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if run.interrupt {
            cancel.cancel();
        }
        Ok(AgentRun {
            stdout: run.stdout.into_bytes(),
            stderr: run.stderr.into_bytes(),
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            cancelled: run.interrupt,
            elapsed: Duration::from_millis(5),
        })
    }
}

/// Locator that finds every program.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTools;

impl ToolLocator for AllTools {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/usr/bin").join(program))
    }
}

/// Temporary git repository with a prompt file and one commit.
#[derive(Debug)]
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub const PROMPT: &'static str = "Build the project.\n";

    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path();
        git(root, &["init", "-q"])?;
        git(root, &["config", "user.email", "loop@example.com"])?;
        git(root, &["config", "user.name", "Loop"])?;
        fs::write(root.join("README.md"), "project\n").context("write README")?;
        git(root, &["add", "README.md"])?;
        git(root, &["commit", "-q", "-m", "chore: init"])?;

        let project = Self { temp };
        let paths = project.paths();
        fs::create_dir_all(&paths.dir).context("create .autoloop")?;
        fs::write(paths.dir.join("PROMPT.md"), Self::PROMPT).context("write prompt")?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> ProjectPaths {
        ProjectPaths::new(self.root())
    }

    /// Defaults, minus the retry backoff.
    pub fn config(&self) -> LoopConfig {
        LoopConfig {
            retry_delay_secs: 0,
            ..LoopConfig::default()
        }
    }

    pub fn write_fix_plan(&self, contents: &str) -> Result<()> {
        let path = self.paths().resolve(&LoopConfig::default().fix_plan_file);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn write_config(&self, contents: &str) -> Result<()> {
        let path = self.paths().config;
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        bail!("git {} failed with {status}", args.join(" "));
    }
    Ok(())
}

/// Record with no progress and no signals.
pub fn idle_record(loop_number: u32) -> LoopRecord {
    LoopRecord {
        loop_number,
        output_length: 1_000,
        ..LoopRecord::default()
    }
}

/// Record that changed `files` files.
pub fn progress_record(loop_number: u32, files: u32) -> LoopRecord {
    LoopRecord {
        files_changed: files,
        ..idle_record(loop_number)
    }
}
