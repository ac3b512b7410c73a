//! Iteration artifacts under `.autoloop/iterations/<loop>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{CircuitState, LoopRecord};
use crate::io::paths::ProjectPaths;

/// Metadata describing one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub loop_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Session resumed by this iteration, if any.
    pub resumed_session: Option<String>,
    /// Parser strategy that produced structured signals.
    pub parsed_by: Option<String>,
    pub parse_failures: Vec<String>,
    pub first_error: Option<String>,
    pub circuit_before: CircuitState,
    pub circuit_after: CircuitState,
    /// Gate outcome (`continue`, an exit reason, or a halt reason).
    pub decision: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub record_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub stream_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &ProjectPaths, loop_number: u32) -> Self {
        let dir = paths.iterations_dir.join(loop_number.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            record_path: dir.join("record.json"),
            agent_log_path: dir.join("agent.log"),
            stream_path: dir.join("agent.stream"),
            dir,
        }
    }
}

/// Write `meta.json` and `record.json`. The agent log is written by the executor.
pub fn write_iteration(
    paths: &IterationPaths,
    meta: &IterationMeta,
    record: &LoopRecord,
) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_json(&paths.meta_path, meta)?;
    write_json(&paths.record_path, record)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
