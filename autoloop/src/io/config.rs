//! Loop configuration stored in `<project>/.autolooprc`.
//!
//! The file is a flat list of `KEY=value` lines so it can also be sourced by a
//! shell. Each value is read as a TOML scalar when it parses as one (numbers,
//! booleans, quoted strings) and as a bare string otherwise; the collected
//! table is then deserialized into [`LoopConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::circuit::CircuitThresholds;
use crate::core::exit_gate::ExitGateConfig;
use crate::core::types::OutputFormat;

/// Loop configuration.
///
/// Missing keys take defaults; unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LoopConfig {
    /// Agent executable (name on PATH or a path).
    pub agent_command: String,
    pub output_format: OutputFormat,
    /// Comma-separated tool allowlist passed to the agent.
    pub allowed_tools: String,
    pub max_calls_per_hour: u32,
    /// Per-invocation timeout.
    pub timeout_minutes: u64,
    pub session_continuity: bool,
    pub session_expiry_hours: u64,
    pub cb_no_progress_threshold: u32,
    pub cb_same_error_threshold: u32,
    pub cb_permission_denial_threshold: u32,
    /// Output length drop (percent) reported as a warning sign.
    pub cb_output_decline_threshold: u32,
    pub completion_threshold: u32,
    pub max_consecutive_done_signals: u32,
    pub test_only_window: usize,
    pub max_test_only_loops: u32,
    /// Backoff after a failed invocation.
    pub retry_delay_secs: u64,
    /// Stdout/stderr bytes kept in memory per invocation.
    pub output_limit_bytes: usize,
    pub prompt_file: PathBuf,
    pub fix_plan_file: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            output_format: OutputFormat::Json,
            allowed_tools: "Write,Read,Edit,Bash(git *)".to_string(),
            max_calls_per_hour: 100,
            timeout_minutes: 15,
            session_continuity: true,
            session_expiry_hours: 24,
            cb_no_progress_threshold: 3,
            cb_same_error_threshold: 5,
            cb_permission_denial_threshold: 2,
            cb_output_decline_threshold: 70,
            completion_threshold: 2,
            max_consecutive_done_signals: 2,
            test_only_window: 5,
            max_test_only_loops: 3,
            retry_delay_secs: 10,
            output_limit_bytes: 1_000_000,
            prompt_file: PathBuf::from(".autoloop/PROMPT.md"),
            fix_plan_file: PathBuf::from(".autoloop/fix_plan.md"),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_command.trim().is_empty() {
            return Err(anyhow!("AGENT_COMMAND must not be empty"));
        }
        let positive: [(&str, u64); 9] = [
            ("MAX_CALLS_PER_HOUR", self.max_calls_per_hour.into()),
            ("TIMEOUT_MINUTES", self.timeout_minutes),
            ("SESSION_EXPIRY_HOURS", self.session_expiry_hours),
            ("CB_NO_PROGRESS_THRESHOLD", self.cb_no_progress_threshold.into()),
            ("CB_SAME_ERROR_THRESHOLD", self.cb_same_error_threshold.into()),
            (
                "CB_PERMISSION_DENIAL_THRESHOLD",
                self.cb_permission_denial_threshold.into(),
            ),
            ("COMPLETION_THRESHOLD", self.completion_threshold.into()),
            ("TEST_ONLY_WINDOW", self.test_only_window as u64),
            ("OUTPUT_LIMIT_BYTES", self.output_limit_bytes as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(anyhow!("{key} must be > 0"));
            }
        }
        if self.cb_output_decline_threshold == 0 || self.cb_output_decline_threshold > 100 {
            return Err(anyhow!("CB_OUTPUT_DECLINE_THRESHOLD must be within 1..=100"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn circuit_thresholds(&self) -> CircuitThresholds {
        CircuitThresholds {
            no_progress: self.cb_no_progress_threshold,
            same_error: self.cb_same_error_threshold,
            permission_denial: self.cb_permission_denial_threshold,
            output_decline_percent: self.cb_output_decline_threshold,
        }
    }

    pub fn gate_config(&self) -> ExitGateConfig {
        ExitGateConfig {
            completion_threshold: self.completion_threshold,
            max_done_signals: self.max_consecutive_done_signals,
            window: self.test_only_window,
            max_test_only_loops: self.max_test_only_loops,
        }
    }

    /// Allowlist entries, split on commas outside parentheses.
    pub fn allowed_tools_list(&self) -> Vec<String> {
        split_allowed_tools(&self.allowed_tools)
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(command) = &overrides.agent_command {
            self.agent_command = command.clone();
        }
        if let Some(format) = overrides.output_format {
            self.output_format = format;
        }
        if let Some(tools) = &overrides.allowed_tools {
            self.allowed_tools = tools.clone();
        }
        if let Some(calls) = overrides.max_calls_per_hour {
            self.max_calls_per_hour = calls;
        }
        if let Some(minutes) = overrides.timeout_minutes {
            self.timeout_minutes = minutes;
        }
        if overrides.no_continue {
            self.session_continuity = false;
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub agent_command: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub allowed_tools: Option<String>,
    pub max_calls_per_hour: Option<u32>,
    pub timeout_minutes: Option<u64>,
    pub no_continue: bool,
}

/// Split `Write,Bash(git add, git commit),Read` into three entries.
pub fn split_allowed_tools(raw: &str) -> Vec<String> {
    let mut tools = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in raw.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                push_tool(&mut tools, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_tool(&mut tools, &current);
    tools
}

fn push_tool(tools: &mut Vec<String>, raw: &str) {
    let tool = raw.trim();
    if !tool.is_empty() {
        tools.push(tool.to_string());
    }
}

/// Load config from a flat `KEY=value` file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = parse_config(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Parse config text. Does not validate value ranges.
pub fn parse_config(contents: &str) -> Result<LoopConfig> {
    let mut table = toml::Table::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("line {}: expected KEY=value, got '{line}'", idx + 1))?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(anyhow!("line {}: invalid key '{key}'", idx + 1));
        }
        table.insert(key.to_string(), parse_value(raw.trim()));
    }
    toml::Value::Table(table)
        .try_into()
        .context("deserialize config values")
}

fn parse_value(raw: &str) -> toml::Value {
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    let raw = if quoted {
        raw
    } else {
        // Inline comments only apply outside quotes.
        raw.split_once(" #").map_or(raw, |(value, _)| value).trim_end()
    };
    let wrapped = format!("value = {raw}");
    match toml::from_str::<toml::Table>(&wrapped) {
        Ok(mut parsed) => match parsed.remove("value") {
            Some(value @ (toml::Value::String(_)
            | toml::Value::Integer(_)
            | toml::Value::Boolean(_)
            | toml::Value::Float(_))) => value,
            _ => toml::Value::String(raw.to_string()),
        },
        Err(_) => toml::Value::String(raw.to_string()),
    }
}
