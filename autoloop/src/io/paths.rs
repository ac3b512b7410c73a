//! Canonical layout of the `.autoloop/` directory.

use std::path::{Path, PathBuf};

/// Directory holding all supervisor files, relative to the project root.
pub const AUTOLOOP_DIR: &str = ".autoloop";
/// Config file name at the project root.
pub const CONFIG_FILE: &str = ".autolooprc";

/// Resolved paths for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub config: PathBuf,
    pub circuit: PathBuf,
    pub circuit_history: PathBuf,
    pub rate_limit: PathBuf,
    pub session: PathBuf,
    pub session_history: PathBuf,
    pub run_state: PathBuf,
    pub loop_history: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let dir = root.join(AUTOLOOP_DIR);
        let state_dir = dir.join("state");
        Self {
            root: root.to_path_buf(),
            iterations_dir: dir.join("iterations"),
            config: root.join(CONFIG_FILE),
            circuit: state_dir.join("circuit_breaker.json"),
            circuit_history: state_dir.join("circuit_history.json"),
            rate_limit: state_dir.join("rate_limit.json"),
            session: state_dir.join("session.json"),
            session_history: state_dir.join("session_history.json"),
            run_state: state_dir.join("run_state.json"),
            loop_history: state_dir.join("loop_history.json"),
            dir,
            state_dir,
        }
    }

    /// Resolve a configured path (absolute, or relative to the project root).
    pub fn resolve(&self, configured: &Path) -> PathBuf {
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.root.join(configured)
        }
    }

    /// True for project-relative paths inside `.autoloop/`.
    pub fn is_internal(path: &str) -> bool {
        path == AUTOLOOP_DIR || path.starts_with(&format!("{AUTOLOOP_DIR}/"))
    }
}
