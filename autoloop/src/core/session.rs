//! Session continuity diagnosis.
//!
//! [`diagnose`] classifies the stored session into a closed set of reason codes
//! so a fresh start is always explained. Only [`SessionDiagnosis::SessionValid`]
//! allows resuming; every other code means "start fresh", never an error.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on the configured expiry; larger values are clamped.
const MAX_EXPIRY_HOURS: u64 = 1_000_000;

/// Reason code for the session decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDiagnosis {
    NoSessionFile,
    EmptySessionFile,
    CorruptedSession,
    MissingSessionId,
    SessionExpired,
    UnparseableTimestamp,
    NoTimestamp,
    SessionValid,
}

impl SessionDiagnosis {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionDiagnosis::NoSessionFile => "no_session_file",
            SessionDiagnosis::EmptySessionFile => "empty_session_file",
            SessionDiagnosis::CorruptedSession => "corrupted_session",
            SessionDiagnosis::MissingSessionId => "missing_session_id",
            SessionDiagnosis::SessionExpired => "session_expired",
            SessionDiagnosis::UnparseableTimestamp => "unparseable_timestamp",
            SessionDiagnosis::NoTimestamp => "no_timestamp",
            SessionDiagnosis::SessionValid => "session_valid",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SessionDiagnosis::NoSessionFile => "No previous session; starting fresh",
            SessionDiagnosis::EmptySessionFile => "Session file is empty; starting fresh",
            SessionDiagnosis::CorruptedSession => "Session file is corrupted; starting fresh",
            SessionDiagnosis::MissingSessionId => "Session file has no session id; starting fresh",
            SessionDiagnosis::SessionExpired => "Session expired; starting fresh",
            SessionDiagnosis::UnparseableTimestamp => {
                "Session timestamp cannot be parsed; starting fresh"
            }
            SessionDiagnosis::NoTimestamp => "Session age is unknown; starting fresh",
            SessionDiagnosis::SessionValid => "Resuming previous session",
        }
    }

    /// Whether the stored file should be discarded rather than left in place.
    pub fn should_discard(self) -> bool {
        !matches!(
            self,
            SessionDiagnosis::NoSessionFile | SessionDiagnosis::SessionValid
        )
    }
}

impl fmt::Display for SessionDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON session record as written by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Creation time (ISO-8601).
    pub timestamp: DateTime<Utc>,
}

/// What the session store found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    Missing,
    Present {
        contents: String,
        /// File modification time, used for legacy plain-text sessions.
        modified: Option<DateTime<Utc>>,
    },
}

/// Diagnosis plus the context needed to act on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub code: SessionDiagnosis,
    pub message: String,
    pub detail: String,
    pub session_id: Option<String>,
    pub age_hours: Option<f64>,
}

impl SessionReport {
    fn new(code: SessionDiagnosis, detail: impl Into<String>) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            detail: detail.into(),
            session_id: None,
            age_hours: None,
        }
    }

    /// Session id to resume, only when the session is valid.
    pub fn resumable_id(&self) -> Option<&str> {
        match self.code {
            SessionDiagnosis::SessionValid => self.session_id.as_deref(),
            _ => None,
        }
    }
}

/// Parsed view of the file contents before the age check.
enum Parsed {
    Empty,
    Corrupted(String),
    MissingId,
    Json {
        id: String,
        timestamp: Option<Result<DateTime<Utc>, String>>,
    },
    Legacy {
        id: String,
    },
}

/// Classify a stored session.
///
/// Age is checked first: a session older than `expiry_hours` is
/// `session_expired` whatever its contents. Age comes from the stored
/// timestamp when it parses, otherwise from the file modification time.
pub fn diagnose(source: &SessionSource, now: DateTime<Utc>, expiry_hours: u64) -> SessionReport {
    let (contents, modified) = match source {
        SessionSource::Missing => {
            return SessionReport::new(SessionDiagnosis::NoSessionFile, "session file not found");
        }
        SessionSource::Present { contents, modified } => (contents.as_str(), *modified),
    };

    let parsed = parse_contents(contents);
    let stored_timestamp = match &parsed {
        Parsed::Json {
            timestamp: Some(Ok(ts)),
            ..
        } => Some(*ts),
        _ => None,
    };
    let reference = stored_timestamp.or(modified);
    let age = reference.map(|ts| now - ts);
    let age_hours = age.map(|age| age.num_seconds() as f64 / 3600.0);

    if let Some(age) = age {
        let limit = Duration::hours(expiry_hours.min(MAX_EXPIRY_HOURS) as i64);
        if age > limit {
            return SessionReport {
                age_hours,
                session_id: parsed.session_id(),
                ..SessionReport::new(
                    SessionDiagnosis::SessionExpired,
                    format!(
                        "session is {:.1}h old (limit {expiry_hours}h)",
                        age_hours.unwrap_or_default()
                    ),
                )
            };
        }
    }

    let mut report = match parsed {
        Parsed::Empty => {
            SessionReport::new(SessionDiagnosis::EmptySessionFile, "session file is empty")
        }
        Parsed::Corrupted(err) => SessionReport::new(SessionDiagnosis::CorruptedSession, err),
        Parsed::MissingId => SessionReport::new(
            SessionDiagnosis::MissingSessionId,
            "session_id field is missing or empty",
        ),
        Parsed::Json {
            id,
            timestamp: None,
        } => SessionReport {
            session_id: Some(id),
            ..SessionReport::new(SessionDiagnosis::NoTimestamp, "timestamp field is missing")
        },
        Parsed::Json {
            id,
            timestamp: Some(Err(raw)),
        } => SessionReport {
            session_id: Some(id),
            ..SessionReport::new(
                SessionDiagnosis::UnparseableTimestamp,
                format!("timestamp '{raw}' is not ISO-8601"),
            )
        },
        Parsed::Json {
            id,
            timestamp: Some(Ok(_)),
        } => SessionReport {
            session_id: Some(id.clone()),
            ..SessionReport::new(SessionDiagnosis::SessionValid, format!("session {id}"))
        },
        Parsed::Legacy { id } if modified.is_none() => SessionReport {
            session_id: Some(id),
            ..SessionReport::new(
                SessionDiagnosis::NoTimestamp,
                "legacy session file without a modification time",
            )
        },
        Parsed::Legacy { id } => SessionReport {
            session_id: Some(id.clone()),
            ..SessionReport::new(
                SessionDiagnosis::SessionValid,
                format!("legacy session {id}"),
            )
        },
    };
    report.age_hours = age_hours;
    report
}

impl Parsed {
    fn session_id(&self) -> Option<String> {
        match self {
            Parsed::Json { id, .. } | Parsed::Legacy { id } => Some(id.clone()),
            _ => None,
        }
    }
}

fn parse_contents(contents: &str) -> Parsed {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Parsed::Empty;
    }
    if trimmed.starts_with('{') {
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => return Parsed::Corrupted(format!("invalid json: {err}")),
        };
        let Some(object) = value.as_object() else {
            return Parsed::Corrupted("session json is not an object".to_string());
        };
        let id = object
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let Some(id) = id else {
            return Parsed::MissingId;
        };
        let timestamp = object.get("timestamp").map(|raw| match raw.as_str() {
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| text.to_string()),
            None => Err(raw.to_string()),
        });
        return Parsed::Json {
            id: id.to_string(),
            timestamp,
        };
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Parsed::Corrupted("legacy session file is not a single id token".to_string());
    }
    Parsed::Legacy {
        id: trimmed.to_string(),
    }
}
