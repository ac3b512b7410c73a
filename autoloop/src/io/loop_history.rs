//! Rolling window of recent [`LoopRecord`]s consumed by the exit gate.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::types::LoopRecord;
use crate::io::atomic::{load_json_or_default, remove_if_exists, write_json_atomic};

/// Records kept on disk; the gate only looks at a short tail.
pub const MAX_RECORDS: usize = 50;

/// `loop_history.json` wrapper.
#[derive(Debug, Clone)]
pub struct LoopHistory {
    path: PathBuf,
    records: Vec<LoopRecord>,
}

impl LoopHistory {
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            records: load_json_or_default(path, "loop history"),
        }
    }

    /// Start an empty history, discarding the previous run's records.
    pub fn fresh(path: &Path) -> Result<Self> {
        remove_if_exists(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            records: Vec::new(),
        })
    }

    pub fn records(&self) -> &[LoopRecord] {
        &self.records
    }

    /// Append and persist, keeping the newest [`MAX_RECORDS`].
    pub fn push(&mut self, record: LoopRecord) -> Result<()> {
        self.records.push(record);
        if self.records.len() > MAX_RECORDS {
            let excess = self.records.len() - MAX_RECORDS;
            self.records.drain(..excess);
        }
        write_json_atomic(&self.path, &self.records)
    }
}
