//! Response analyzer: turns one invocation's raw output into a [`LoopRecord`].
//!
//! Parsing is an ordered list of [`ParseStrategy`] values. Each strategy either
//! yields [`StructuredSignals`] or a [`ParseFailure`]; the first success wins and
//! total failure falls back to conservative defaults. Heuristics from
//! [`heuristics`](crate::core::heuristics) run over the narrative text
//! regardless of which strategy succeeded.
//!
//! The analyzer never fails: empty, truncated, or non-UTF-8 output still
//! produces a well-formed record.

use std::fmt;

use serde_json::{Map, Value};

use crate::core::heuristics::{
    count_completion_indicators, has_permission_denial, is_test_only_work, mentions_api_limit,
    scan_errors,
};
use crate::core::types::{AgentStatus, LoopRecord, OutputFormat};

/// Begin/end markers for the agent's status block.
pub const STATUS_BLOCK_MARKERS: &[(&str, &str)] = &[
    ("---LOOP_STATUS---", "---END_LOOP_STATUS---"),
    ("<loop_status>", "</loop_status>"),
];

/// Everything the analyzer needs about one invocation.
#[derive(Debug, Clone)]
pub struct AnalyzerInput<'a> {
    pub loop_number: u32,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
    pub format: OutputFormat,
    /// Files changed according to the git diff.
    pub files_changed: u32,
    /// The invocation timed out or exited non-zero.
    pub failed: bool,
}

/// Fields an agent can report explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructuredSignals {
    pub status: Option<AgentStatus>,
    pub exit_signal: Option<bool>,
    pub files_modified: Option<u32>,
    pub tasks_completed: Option<u32>,
    pub has_errors: Option<bool>,
    pub permission_denials: Option<u32>,
    pub session_id: Option<String>,
    pub work_type: Option<String>,
    pub summary: Option<String>,
    /// Free text the heuristics should scan instead of the raw output.
    pub narrative: Option<String>,
}

impl StructuredSignals {
    /// Fill fields that are still unset from `other`.
    fn merge_missing(&mut self, other: StructuredSignals) {
        self.status = self.status.or(other.status);
        self.exit_signal = self.exit_signal.or(other.exit_signal);
        self.files_modified = self.files_modified.or(other.files_modified);
        self.tasks_completed = self.tasks_completed.or(other.tasks_completed);
        self.has_errors = self.has_errors.or(other.has_errors);
        self.permission_denials = self.permission_denials.or(other.permission_denials);
        if self.session_id.is_none() {
            self.session_id = other.session_id;
        }
        if self.work_type.is_none() {
            self.work_type = other.work_type;
        }
        if self.summary.is_none() {
            self.summary = other.summary;
        }
    }
}

/// A way of extracting structured signals from output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// The whole output is a JSON object (or array of event objects).
    Json,
    /// Plain text with a delimited `KEY: value` status block.
    StatusBlock,
}

/// Why a strategy did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    Empty,
    NotJson(String),
    MissingResultField,
    NoStatusBlock,
    UnterminatedStatusBlock,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailure::Empty => f.write_str("empty output"),
            ParseFailure::NotJson(err) => write!(f, "not json: {err}"),
            ParseFailure::MissingResultField => f.write_str("json has no result field"),
            ParseFailure::NoStatusBlock => f.write_str("no status block"),
            ParseFailure::UnterminatedStatusBlock => f.write_str("status block not terminated"),
        }
    }
}

impl ParseStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseStrategy::Json => "json",
            ParseStrategy::StatusBlock => "status_block",
        }
    }

    pub fn parse(self, text: &str) -> Result<StructuredSignals, ParseFailure> {
        if text.trim().is_empty() {
            return Err(ParseFailure::Empty);
        }
        match self {
            ParseStrategy::Json => parse_json(text),
            ParseStrategy::StatusBlock => parse_status_block(text),
        }
    }
}

/// Strategy order for a format hint: the hinted format first, the other as fallback.
pub fn strategies_for(format: OutputFormat) -> &'static [ParseStrategy] {
    match format {
        OutputFormat::Json => &[ParseStrategy::Json, ParseStrategy::StatusBlock],
        OutputFormat::Text => &[ParseStrategy::StatusBlock, ParseStrategy::Json],
    }
}

/// Full analysis result, including which strategy produced the signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub record: LoopRecord,
    pub parsed_by: Option<ParseStrategy>,
    pub failures: Vec<(ParseStrategy, ParseFailure)>,
    pub first_error: Option<String>,
}

/// Analyze one invocation and return its record.
pub fn analyze(input: &AnalyzerInput<'_>) -> LoopRecord {
    analyze_with_trace(input).record
}

/// Analyze one invocation, keeping parse diagnostics for logging.
pub fn analyze_with_trace(input: &AnalyzerInput<'_>) -> Analysis {
    let stdout = String::from_utf8_lossy(input.stdout);
    let stderr = String::from_utf8_lossy(input.stderr);

    let mut failures = Vec::new();
    let mut parsed_by = None;
    let mut signals = StructuredSignals::default();
    for strategy in strategies_for(input.format) {
        match strategy.parse(&stdout) {
            Ok(found) => {
                signals = found;
                parsed_by = Some(*strategy);
                break;
            }
            Err(failure) => failures.push((*strategy, failure)),
        }
    }

    let narrative = signals.narrative.as_deref().unwrap_or(&stdout);
    let error_scan = scan_errors(narrative);
    let stderr_errors = if input.failed {
        scan_errors(&stderr).occurrences
    } else {
        0
    };

    // An explicit error flag from the agent beats the text scan.
    let has_errors = input.failed
        || signals
            .has_errors
            .unwrap_or(error_scan.occurrences > 0 || stderr_errors > 0);

    let has_permission_denials = signals.permission_denials.unwrap_or(0) > 0
        || has_permission_denial(narrative)
        || has_permission_denial(&stderr);

    let is_test_only = match signals.work_type.as_deref() {
        Some(work) => work.eq_ignore_ascii_case("testing") || work.eq_ignore_ascii_case("test"),
        None => is_test_only_work(narrative),
    };

    let api_limit_reached = (input.failed || signals.has_errors == Some(true))
        && (mentions_api_limit(&stdout) || mentions_api_limit(&stderr));

    let mut record = LoopRecord {
        loop_number: input.loop_number,
        files_changed: input.files_changed,
        has_errors,
        has_completion_signal: signals.status == Some(AgentStatus::Complete),
        exit_signal: signals.exit_signal.unwrap_or(false),
        files_modified_reported: signals.files_modified.unwrap_or(0),
        has_permission_denials,
        output_length: input.stdout.len(),
        completion_indicators: count_completion_indicators(narrative),
        is_test_only,
        tasks_completed: signals.tasks_completed.unwrap_or(0),
        api_limit_reached,
        session_id: signals.session_id.clone(),
        summary: signals.summary.clone(),
    };

    if input.failed {
        // A failed invocation's self-reports are not trusted; real file changes still count.
        record.has_completion_signal = false;
        record.exit_signal = false;
        record.files_modified_reported = 0;
        record.tasks_completed = 0;
        record.is_test_only = false;
    }

    Analysis {
        record,
        parsed_by,
        failures,
        first_error: error_scan.first,
    }
}

fn parse_json(text: &str) -> Result<StructuredSignals, ParseFailure> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|err| ParseFailure::NotJson(err.to_string()))?;

    let mut signals = match &value {
        Value::Object(map) => signals_from_result_object(map)?,
        Value::Array(events) => signals_from_event_array(events)?,
        _ => return Err(ParseFailure::MissingResultField),
    };

    if let Some(narrative) = signals.narrative.clone()
        && let Ok(block) = parse_status_block(&narrative)
    {
        signals.merge_missing(block);
    }
    Ok(signals)
}

/// Claude-style event arrays: the last `result` event carries the outcome, the
/// first event with a session id carries the session.
fn signals_from_event_array(events: &[Value]) -> Result<StructuredSignals, ParseFailure> {
    let result = events
        .iter()
        .rev()
        .filter_map(Value::as_object)
        .find(|event| event.get("type").and_then(Value::as_str) == Some("result"))
        .ok_or(ParseFailure::MissingResultField)?;
    let mut signals = signals_from_result_object(result)?;
    if signals.session_id.is_none() {
        signals.session_id = events
            .iter()
            .filter_map(Value::as_object)
            .find_map(session_id_of);
    }
    Ok(signals)
}

fn signals_from_result_object(map: &Map<String, Value>) -> Result<StructuredSignals, ParseFailure> {
    let narrative = ["result", "text", "response"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .ok_or(ParseFailure::MissingResultField)?;

    let mut signals = StructuredSignals {
        session_id: session_id_of(map),
        has_errors: map.get("is_error").and_then(Value::as_bool),
        permission_denials: map
            .get("permission_denials")
            .and_then(Value::as_array)
            .map(|denials| denials.len() as u32),
        narrative: Some(narrative.to_string()),
        ..StructuredSignals::default()
    };

    if let Some(meta) = map.get("metadata").and_then(Value::as_object) {
        signals.files_modified = meta.get("files_changed").and_then(json_u32);
        if let Some(has_errors) = meta.get("has_errors").and_then(json_bool) {
            signals.has_errors = Some(signals.has_errors.unwrap_or(false) || has_errors);
        }
        signals.status = meta
            .get("completion_status")
            .and_then(Value::as_str)
            .and_then(AgentStatus::parse);
        signals.exit_signal = meta.get("exit_signal").and_then(json_bool);
        signals.tasks_completed = meta.get("tasks_completed").and_then(json_u32);
        signals.work_type = meta
            .get("work_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        signals.summary = meta
            .get("recommendation")
            .or_else(|| meta.get("summary"))
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    Ok(signals)
}

fn session_id_of(map: &Map<String, Value>) -> Option<String> {
    ["session_id", "sessionId"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn json_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n.min(u32::MAX as u64) as u32),
        Value::String(s) => parse_count(s),
        _ => None,
    }
}

fn json_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => parse_bool(s),
        _ => None,
    }
}

fn parse_status_block(text: &str) -> Result<StructuredSignals, ParseFailure> {
    let mut saw_begin = false;
    for (begin, end) in STATUS_BLOCK_MARKERS {
        // The agent may echo the template earlier in its output; the last block wins.
        let Some(start) = text.rfind(begin) else {
            continue;
        };
        saw_begin = true;
        let body_start = start + begin.len();
        let Some(len) = text[body_start..].find(end) else {
            continue;
        };
        return Ok(parse_status_lines(&text[body_start..body_start + len], text));
    }
    if saw_begin {
        Err(ParseFailure::UnterminatedStatusBlock)
    } else {
        Err(ParseFailure::NoStatusBlock)
    }
}

fn parse_status_lines(block: &str, full_text: &str) -> StructuredSignals {
    let mut signals = StructuredSignals {
        narrative: Some(full_text.to_string()),
        ..StructuredSignals::default()
    };
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "STATUS" => signals.status = AgentStatus::parse(value),
            "EXIT_SIGNAL" => signals.exit_signal = parse_bool(value),
            "FILES_MODIFIED" => signals.files_modified = parse_count(value),
            "TASKS_COMPLETED_THIS_LOOP" | "TASKS_COMPLETED" => {
                signals.tasks_completed = parse_count(value);
            }
            "WORK_TYPE" => signals.work_type = Some(value.to_string()).filter(|v| !v.is_empty()),
            "RECOMMENDATION" | "SUMMARY" => {
                signals.summary = Some(value.to_string()).filter(|v| !v.is_empty());
            }
            _ => {}
        }
    }
    signals
}

fn parse_bool(value: &str) -> Option<bool> {
    match value
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_ascii_lowercase()
        .as_str()
    {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Leading integer of a value such as `3` or `3 files`.
fn parse_count(value: &str) -> Option<u32> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(stdout: &str, format: OutputFormat) -> AnalyzerInput<'_> {
        AnalyzerInput {
            loop_number: 4,
            stdout: stdout.as_bytes(),
            stderr: b"",
            format,
            files_changed: 0,
            failed: false,
        }
    }

    #[test]
    fn empty_output_yields_default_record() {
        let record = analyze(&input("", OutputFormat::Json));
        assert_eq!(
            record,
            LoopRecord {
                loop_number: 4,
                ..LoopRecord::default()
            }
        );
    }

    #[test]
    fn truncated_json_falls_back_without_panicking() {
        let analysis = analyze_with_trace(&input(
            r#"{"type":"result","result":"working on it","session_id":"abc"#,
            OutputFormat::Json,
        ));
        assert_eq!(analysis.parsed_by, None);
        assert!(matches!(analysis.failures[0].1, ParseFailure::NotJson(_)));
        assert_eq!(analysis.failures[1].1, ParseFailure::NoStatusBlock);
        assert!(!analysis.record.has_errors);
        assert_eq!(analysis.record.session_id, None);
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        let stdout = [0xff, 0xfe, b'o', b'k'];
        let record = analyze(&AnalyzerInput {
            loop_number: 1,
            stdout: &stdout,
            stderr: &[],
            format: OutputFormat::Text,
            files_changed: 2,
            failed: false,
        });
        assert_eq!(record.files_changed, 2);
        assert_eq!(record.output_length, 4);
    }

    #[test]
    fn json_result_with_metadata() {
        let stdout = r#"{
  "type": "result",
  "result": "Implemented the config loader.",
  "session_id": "sess-42",
  "metadata": {
    "files_changed": 3,
    "has_errors": false,
    "completion_status": "in_progress",
    "exit_signal": false
  }
}"#;
        let analysis = analyze_with_trace(&input(stdout, OutputFormat::Json));
        assert_eq!(analysis.parsed_by, Some(ParseStrategy::Json));
        let record = analysis.record;
        assert_eq!(record.session_id.as_deref(), Some("sess-42"));
        assert_eq!(record.files_modified_reported, 3);
        assert!(!record.has_errors);
        assert!(!record.has_completion_signal);
        assert!(!record.exit_signal);
        assert!(record.has_progress());
    }

    #[test]
    fn json_error_substrings_in_field_names_are_not_errors() {
        let stdout = r#"{"result":"done for now","is_error":false,"metadata":{"has_errors":false,"error_count":0}}"#;
        let record = analyze(&input(stdout, OutputFormat::Json));
        assert!(!record.has_errors);

        // Same content without an explicit flag goes through the text scan.
        let stdout = r#"{"result":"has_errors: false, error_count: 0"}"#;
        let record = analyze(&input(stdout, OutputFormat::Json));
        assert!(!record.has_errors);
    }

    #[test]
    fn json_result_embeds_status_block() {
        let stdout = serde_json::json!({
            "type": "result",
            "is_error": false,
            "session_id": "s-1",
            "result": "All tasks are complete.\n---LOOP_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\nFILES_MODIFIED: 0\nTASKS_COMPLETED_THIS_LOOP: 1\n---END_LOOP_STATUS---",
        })
        .to_string();
        let record = analyze(&input(&stdout, OutputFormat::Json));
        assert!(record.has_completion_signal);
        assert!(record.exit_signal);
        assert_eq!(record.tasks_completed, 1);
        assert_eq!(record.completion_indicators, 1);
    }

    #[test]
    fn json_event_array_uses_last_result() {
        let stdout = serde_json::json!([
            {"type": "system", "subtype": "init", "session_id": "from-init"},
            {"type": "assistant", "message": "working"},
            {"type": "result", "result": "partial", "is_error": false},
        ])
        .to_string();
        let record = analyze(&input(&stdout, OutputFormat::Json));
        assert_eq!(record.session_id.as_deref(), Some("from-init"));
        assert!(!record.has_errors);
    }

    #[test]
    fn json_permission_denials_array() {
        let stdout = r#"{"result":"could not write","permission_denials":[{"tool_name":"Write"}]}"#;
        let record = analyze(&input(stdout, OutputFormat::Json));
        assert!(record.has_permission_denials);
    }

    #[test]
    fn json_without_result_field_falls_back_to_text() {
        let stdout = "{\"status\":\"ok\"}";
        let analysis = analyze_with_trace(&input(stdout, OutputFormat::Json));
        assert_eq!(analysis.failures[0].1, ParseFailure::MissingResultField);
        assert_eq!(analysis.parsed_by, None);
    }

    #[test]
    fn text_status_block_is_parsed() {
        let stdout = "Did some work.\n---LOOP_STATUS---\nSTATUS: IN_PROGRESS\nEXIT_SIGNAL: false\nFILES_MODIFIED: 2\nTASKS_COMPLETED_THIS_LOOP: 1\nWORK_TYPE: IMPLEMENTATION\nRECOMMENDATION: continue with parser\nMYSTERY_KEY: 9\n---END_LOOP_STATUS---\n";
        let analysis = analyze_with_trace(&input(stdout, OutputFormat::Text));
        assert_eq!(analysis.parsed_by, Some(ParseStrategy::StatusBlock));
        let record = analysis.record;
        assert_eq!(record.files_modified_reported, 2);
        assert_eq!(record.tasks_completed, 1);
        assert!(!record.exit_signal);
        assert!(!record.is_test_only);
        assert_eq!(record.summary.as_deref(), Some("continue with parser"));
    }

    #[test]
    fn status_block_missing_keys_default_conservatively() {
        let stdout = "---LOOP_STATUS---\nSTATUS: sideways\nEXIT_SIGNAL: perhaps\n---END_LOOP_STATUS---";
        let record = analyze(&input(stdout, OutputFormat::Text));
        assert!(!record.exit_signal);
        assert!(!record.has_completion_signal);
        assert_eq!(record.files_modified_reported, 0);
    }

    #[test]
    fn last_status_block_wins() {
        let stdout = "Template:\n---LOOP_STATUS---\nEXIT_SIGNAL: true\n---END_LOOP_STATUS---\nActual:\n---LOOP_STATUS---\nEXIT_SIGNAL: false\n---END_LOOP_STATUS---";
        let record = analyze(&input(stdout, OutputFormat::Text));
        assert!(!record.exit_signal);
    }

    #[test]
    fn unterminated_block_is_a_failure() {
        let analysis = analyze_with_trace(&input(
            "---LOOP_STATUS---\nEXIT_SIGNAL: true\n",
            OutputFormat::Text,
        ));
        assert_eq!(
            analysis.failures[0].1,
            ParseFailure::UnterminatedStatusBlock
        );
        assert!(!analysis.record.exit_signal);
    }

    #[test]
    fn completion_phrases_do_not_set_exit_signal() {
        let record = analyze(&input(
            "All tasks are complete. Nothing left to do. Project complete.",
            OutputFormat::Text,
        ));
        assert_eq!(record.completion_indicators, 3);
        assert!(!record.exit_signal);
        assert!(!record.has_completion_signal);
    }

    #[test]
    fn failed_invocation_discards_self_reports() {
        let stdout = "---LOOP_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\nFILES_MODIFIED: 4\n---END_LOOP_STATUS---";
        let record = analyze(&AnalyzerInput {
            loop_number: 2,
            stdout: stdout.as_bytes(),
            stderr: b"",
            format: OutputFormat::Text,
            files_changed: 1,
            failed: true,
        });
        assert!(record.has_errors);
        assert!(!record.exit_signal);
        assert!(!record.has_completion_signal);
        assert_eq!(record.files_modified_reported, 0);
        assert_eq!(record.files_changed, 1);
    }

    #[test]
    fn api_limit_only_on_failure() {
        let text = "Claude AI usage limit reached";
        let ok = analyze(&input(text, OutputFormat::Text));
        assert!(!ok.api_limit_reached);

        let failed = analyze(&AnalyzerInput {
            failed: true,
            ..input(text, OutputFormat::Text)
        });
        assert!(failed.api_limit_reached);
    }

    #[test]
    fn text_errors_are_detected_without_explicit_flag() {
        let record = analyze(&input(
            "running build\nerror: linker `cc` not found\n",
            OutputFormat::Text,
        ));
        assert!(record.has_errors);
    }

    #[test]
    fn test_only_from_work_type() {
        let stdout = "---LOOP_STATUS---\nWORK_TYPE: TESTING\n---END_LOOP_STATUS---";
        assert!(analyze(&input(stdout, OutputFormat::Text)).is_test_only);
    }
}
