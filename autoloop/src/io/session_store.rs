//! Session file storage, auto-reset, and reset history.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::session::{SessionDiagnosis, SessionRecord, SessionReport, SessionSource, diagnose};
use crate::io::atomic::{load_json_or_default, remove_if_exists, write_json_atomic};
use crate::io::paths::ProjectPaths;

/// Entries kept in `session_history.json`.
pub const MAX_HISTORY: usize = 50;

/// Why a session was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResetReason {
    CircuitOpen,
    Interrupted,
    ProjectComplete,
    ManualReset,
    Expired,
    /// Unreadable or incomplete session file.
    Invalid,
}

impl SessionResetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionResetReason::CircuitOpen => "circuit_open",
            SessionResetReason::Interrupted => "interrupted",
            SessionResetReason::ProjectComplete => "project_complete",
            SessionResetReason::ManualReset => "manual_reset",
            SessionResetReason::Expired => "expired",
            SessionResetReason::Invalid => "invalid",
        }
    }
}

impl fmt::Display for SessionResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Reset,
}

/// One entry of `session_history.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: SessionEventKind,
    pub session_id: Option<String>,
    pub reason: Option<SessionResetReason>,
}

/// Session file plus its history file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    history_path: PathBuf,
}

impl SessionStore {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            path: paths.session.clone(),
            history_path: paths.session_history.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw session file for diagnosis.
    pub fn source(&self) -> SessionSource {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let modified = fs::metadata(&self.path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
                SessionSource::Present {
                    contents: String::from_utf8_lossy(&bytes).into_owned(),
                    modified,
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SessionSource::Missing,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable session file");
                SessionSource::Present {
                    contents: String::new(),
                    modified: None,
                }
            }
        }
    }

    pub fn diagnose(&self, now: DateTime<Utc>, expiry_hours: u64) -> SessionReport {
        diagnose(&self.source(), now, expiry_hours)
    }

    /// Decide whether to resume, discarding an unusable file.
    ///
    /// Returns the diagnosis; its [`SessionReport::resumable_id`] is the
    /// session to resume.
    pub fn resolve(&self, now: DateTime<Utc>, expiry_hours: u64) -> Result<SessionReport> {
        let report = self.diagnose(now, expiry_hours);
        if report.code == SessionDiagnosis::SessionValid {
            debug!(session_id = ?report.session_id, age_hours = ?report.age_hours, "resuming session");
        } else {
            info!(code = %report.code, detail = %report.detail, "{}", report.message);
        }
        if report.code.should_discard() {
            let reason = if report.code == SessionDiagnosis::SessionExpired {
                SessionResetReason::Expired
            } else {
                SessionResetReason::Invalid
            };
            self.reset(reason, now)?;
        }
        Ok(report)
    }

    /// Store the session id reported by the agent.
    ///
    /// The creation timestamp is kept when the id is unchanged, so expiry
    /// counts from the first time the session was seen.
    pub fn save(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let existing = match self.source() {
            SessionSource::Present { contents, .. } => {
                serde_json::from_str::<SessionRecord>(&contents).ok()
            }
            SessionSource::Missing => None,
        };
        if let Some(record) = &existing
            && record.session_id == session_id
        {
            return Ok(());
        }
        let record = SessionRecord {
            session_id: session_id.to_string(),
            timestamp: now,
        };
        write_json_atomic(&self.path, &record)?;
        info!(session_id, "session stored");
        self.append_event(SessionEvent {
            timestamp: now,
            event: SessionEventKind::Created,
            session_id: Some(session_id.to_string()),
            reason: None,
        })
    }

    /// Discard the session. Returns true when a file was removed.
    pub fn reset(&self, reason: SessionResetReason, now: DateTime<Utc>) -> Result<bool> {
        let session_id = self.diagnose(now, u64::MAX).session_id;
        let removed = remove_if_exists(&self.path)
            .with_context(|| format!("reset session {}", self.path.display()))?;
        if removed {
            info!(%reason, session_id = ?session_id, "session reset");
            self.append_event(SessionEvent {
                timestamp: now,
                event: SessionEventKind::Reset,
                session_id,
                reason: Some(reason),
            })?;
        }
        Ok(removed)
    }

    pub fn history(&self) -> Vec<SessionEvent> {
        load_json_or_default(&self.history_path, "session history")
    }

    fn append_event(&self, event: SessionEvent) -> Result<()> {
        let mut history = self.history();
        history.push(event);
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        write_json_atomic(&self.history_path, &history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store(root: &Path) -> SessionStore {
        SessionStore::new(&ProjectPaths::new(root))
    }

    #[test]
    fn save_then_resume() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let now = Utc::now();
        store.save("sess-42", now).expect("save");

        let report = store.resolve(now + Duration::hours(1), 24).expect("resolve");
        assert_eq!(report.code, SessionDiagnosis::SessionValid);
        assert_eq!(report.resumable_id(), Some("sess-42"));
    }

    #[test]
    fn same_id_keeps_creation_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let created = Utc::now() - Duration::hours(30);
        store.save("sess-1", created).expect("save");
        store.save("sess-1", Utc::now()).expect("save again");

        let report = store.resolve(Utc::now(), 24).expect("resolve");
        assert_eq!(report.code, SessionDiagnosis::SessionExpired);
        assert!(!store.path().exists());
        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].reason, Some(SessionResetReason::Expired));
    }

    #[test]
    fn corrupted_file_is_discarded_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), "{\"session_id\": ").expect("write");

        let report = store.resolve(Utc::now(), 24).expect("resolve");
        assert_eq!(report.code, SessionDiagnosis::CorruptedSession);
        assert_eq!(report.resumable_id(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn reset_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let now = Utc::now();
        store.save("sess-9", now).expect("save");

        assert!(store.reset(SessionResetReason::ManualReset, now).expect("reset"));
        assert!(!store.reset(SessionResetReason::ManualReset, now).expect("reset again"));
        assert_eq!(
            store.diagnose(now, 24).code,
            SessionDiagnosis::NoSessionFile
        );
        assert_eq!(store.history().len(), 2);
    }
}
