//! Pre-flight health checks run before every invocation.
//!
//! Checks are ordered and independent; any [`HealthStatus::Error`] blocks the
//! iteration before the agent is spawned. Each failure names its remedy.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::plan::count_tasks;
use crate::io::config::{LoopConfig, load_config};
use crate::io::git::Git;
use crate::io::paths::ProjectPaths;

static TOOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]*(\([^()]*\))?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Warn => "WARN",
            HealthStatus::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: HealthStatus,
    pub message: String,
}

impl HealthCheck {
    fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: HealthStatus::Ok,
            message: message.into(),
        }
    }

    fn warn(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: HealthStatus::Warn,
            message: message.into(),
        }
    }

    fn error(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: HealthStatus::Error,
            message: message.into(),
        }
    }
}

/// Ordered check results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn has_errors(&self) -> bool {
        self.checks.iter().any(|c| c.status == HealthStatus::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks
            .iter()
            .filter(|c| c.status == HealthStatus::Error)
    }

    /// First error as `name: message`, for the halt reason.
    pub fn summary(&self) -> Option<String> {
        self.errors()
            .next()
            .map(|c| format!("{}: {}", c.name, c.message))
    }
}

/// Finds executables. Abstracted so tests do not depend on the host PATH.
pub trait ToolLocator {
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Looks programs up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl ToolLocator for PathLocator {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(program);
            return path.is_file().then(|| path.to_path_buf());
        }
        which::which(program).ok()
    }
}

/// Inputs for one round of checks.
#[derive(Debug, Clone)]
pub struct HealthInput<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a LoopConfig,
    /// Agent program to look up; `None` skips the lookup.
    pub agent_program: Option<&'a str>,
    pub rate_remaining: u32,
}

/// Run every check in order.
pub fn run_health_checks(input: &HealthInput<'_>, locator: &dyn ToolLocator) -> HealthReport {
    let mut checks = vec![check_agent_cli(input.agent_program, locator)];
    let git = check_git(locator);
    let git_present = git.status == HealthStatus::Ok;
    checks.push(git);
    if git_present {
        checks.push(check_git_repository(&input.paths.root));
    }
    checks.push(check_prompt_file(&input.paths.resolve(&input.config.prompt_file)));
    checks.push(check_fix_plan(&input.paths.resolve(&input.config.fix_plan_file)));
    checks.push(check_rate_limit(input.rate_remaining, input.config.max_calls_per_hour));
    checks.push(check_config(&input.paths.config));
    checks.push(check_allowed_tools(input.config));

    let report = HealthReport { checks };
    for check in &report.checks {
        match check.status {
            HealthStatus::Ok => debug!(check = check.name, message = %check.message, "health check ok"),
            HealthStatus::Warn => warn!(check = check.name, message = %check.message, "health check warning"),
            HealthStatus::Error => warn!(check = check.name, message = %check.message, "health check failed"),
        }
    }
    report
}

fn check_agent_cli(program: Option<&str>, locator: &dyn ToolLocator) -> HealthCheck {
    let Some(program) = program else {
        return HealthCheck::ok("agent_cli", "in-process executor");
    };
    match locator.locate(program) {
        Some(path) => HealthCheck::ok("agent_cli", format!("{program} at {}", path.display())),
        None => HealthCheck::error(
            "agent_cli",
            format!(
                "agent CLI '{program}' not found; install it (npm install -g @anthropic-ai/claude-code) or set AGENT_COMMAND in .autolooprc"
            ),
        ),
    }
}

fn check_git(locator: &dyn ToolLocator) -> HealthCheck {
    match locator.locate("git") {
        Some(path) => HealthCheck::ok("git", format!("git at {}", path.display())),
        None => HealthCheck::error(
            "git",
            "git not found; install git, it is needed to measure file changes",
        ),
    }
}

fn check_git_repository(root: &Path) -> HealthCheck {
    if Git::new(root).is_repository() {
        HealthCheck::ok("git_repository", "inside a git work tree")
    } else {
        HealthCheck::warn(
            "git_repository",
            "not a git repository; file changes cannot be measured (run `git init`)",
        )
    }
}

fn check_prompt_file(path: &Path) -> HealthCheck {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => HealthCheck::error(
            "prompt_file",
            format!("{} is empty; describe the work for the agent", path.display()),
        ),
        Ok(_) => HealthCheck::ok("prompt_file", path.display().to_string()),
        Err(_) => HealthCheck::error(
            "prompt_file",
            format!(
                "{} not found; create it or set PROMPT_FILE in .autolooprc",
                path.display()
            ),
        ),
    }
}

fn check_fix_plan(path: &Path) -> HealthCheck {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let tasks = count_tasks(&contents);
            HealthCheck::ok(
                "fix_plan",
                format!("{}/{} tasks complete", tasks.completed, tasks.total),
            )
        }
        Err(_) => HealthCheck::warn(
            "fix_plan",
            format!(
                "{} not found; plan-based completion is disabled",
                path.display()
            ),
        ),
    }
}

fn check_rate_limit(remaining: u32, max_calls: u32) -> HealthCheck {
    if remaining == 0 {
        return HealthCheck::error(
            "rate_limit",
            format!("0/{max_calls} calls left this hour; wait for the window to reset"),
        );
    }
    let message = format!("{remaining}/{max_calls} calls left this hour");
    if u64::from(remaining) * 100 <= u64::from(max_calls) * 5 {
        HealthCheck::warn("rate_limit", message)
    } else {
        HealthCheck::ok("rate_limit", message)
    }
}

fn check_config(path: &Path) -> HealthCheck {
    if !path.exists() {
        return HealthCheck::ok("config", "no .autolooprc, using defaults");
    }
    match load_config(path) {
        Ok(_) => HealthCheck::ok("config", path.display().to_string()),
        Err(err) => HealthCheck::error("config", format!("{err:#}")),
    }
}

fn check_allowed_tools(config: &LoopConfig) -> HealthCheck {
    let tools = config.allowed_tools_list();
    if tools.is_empty() {
        return HealthCheck::warn(
            "allowed_tools",
            "ALLOWED_TOOLS is empty; the agent will be denied every tool",
        );
    }
    let invalid: Vec<&str> = tools
        .iter()
        .map(String::as_str)
        .filter(|tool| !TOOL_RE.is_match(tool))
        .collect();
    if !invalid.is_empty() {
        return HealthCheck::error(
            "allowed_tools",
            format!(
                "malformed ALLOWED_TOOLS entries: {}; use Name or Name(pattern)",
                invalid.join(", ")
            ),
        );
    }
    HealthCheck::ok("allowed_tools", format!("{} tools allowed", tools.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeLocator(HashMap<&'static str, PathBuf>);

    impl ToolLocator for FakeLocator {
        fn locate(&self, program: &str) -> Option<PathBuf> {
            self.0.get(program).cloned()
        }
    }

    fn locator(programs: &[&'static str]) -> FakeLocator {
        FakeLocator(
            programs
                .iter()
                .map(|p| (*p, PathBuf::from(format!("/usr/bin/{p}"))))
                .collect(),
        )
    }

    fn project() -> (tempfile::TempDir, ProjectPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::create_dir_all(&paths.dir).expect("mkdir");
        fs::write(paths.dir.join("PROMPT.md"), "Build the thing.\n").expect("prompt");
        (temp, paths)
    }

    fn status_of(report: &HealthReport, name: &str) -> Option<HealthStatus> {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
    }

    #[test]
    fn healthy_project_has_no_errors() {
        let (_temp, paths) = project();
        let config = LoopConfig::default();
        let report = run_health_checks(
            &HealthInput {
                paths: &paths,
                config: &config,
                agent_program: Some("claude"),
                rate_remaining: 100,
            },
            &locator(&["claude", "git"]),
        );
        assert!(!report.has_errors(), "{report:?}");
        assert_eq!(status_of(&report, "fix_plan"), Some(HealthStatus::Warn));
        assert_eq!(status_of(&report, "git_repository"), Some(HealthStatus::Warn));
    }

    #[test]
    fn missing_agent_is_an_error_with_remedy() {
        let (_temp, paths) = project();
        let config = LoopConfig::default();
        let report = run_health_checks(
            &HealthInput {
                paths: &paths,
                config: &config,
                agent_program: Some("claude"),
                rate_remaining: 100,
            },
            &locator(&["git"]),
        );
        assert!(report.has_errors());
        let summary = report.summary().expect("summary");
        assert!(summary.starts_with("agent_cli:"));
        assert!(summary.contains("AGENT_COMMAND"));
    }

    #[test]
    fn missing_git_skips_repository_check() {
        let (_temp, paths) = project();
        let config = LoopConfig::default();
        let report = run_health_checks(
            &HealthInput {
                paths: &paths,
                config: &config,
                agent_program: None,
                rate_remaining: 100,
            },
            &locator(&[]),
        );
        assert_eq!(status_of(&report, "git"), Some(HealthStatus::Error));
        assert_eq!(status_of(&report, "git_repository"), None);
    }

    #[test]
    fn missing_prompt_and_bad_config_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::write(&paths.config, "MAX_CALLS_PER_HOUR=lots\n").expect("config");
        let config = LoopConfig::default();
        let report = run_health_checks(
            &HealthInput {
                paths: &paths,
                config: &config,
                agent_program: None,
                rate_remaining: 100,
            },
            &locator(&["git"]),
        );
        assert_eq!(status_of(&report, "prompt_file"), Some(HealthStatus::Error));
        assert_eq!(status_of(&report, "config"), Some(HealthStatus::Error));
    }

    #[test]
    fn rate_limit_levels() {
        assert_eq!(check_rate_limit(0, 100).status, HealthStatus::Error);
        assert_eq!(check_rate_limit(5, 100).status, HealthStatus::Warn);
        assert_eq!(check_rate_limit(6, 100).status, HealthStatus::Ok);
    }

    #[test]
    fn allowed_tools_sanity() {
        let mut config = LoopConfig::default();
        assert_eq!(check_allowed_tools(&config).status, HealthStatus::Ok);

        config.allowed_tools = "Write,Bash(git *".to_string();
        assert_eq!(check_allowed_tools(&config).status, HealthStatus::Error);

        config.allowed_tools = "mcp__github__create_issue,Read".to_string();
        assert_eq!(check_allowed_tools(&config).status, HealthStatus::Ok);

        config.allowed_tools = String::new();
        assert_eq!(check_allowed_tools(&config).status, HealthStatus::Warn);
    }
}
