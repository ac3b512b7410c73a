//! Text heuristics over agent output.
//!
//! Each function is a pure classifier returning a count or a flag. None of them
//! decides anything on its own; the analyzer combines them into a
//! [`LoopRecord`](crate::core::types::LoopRecord) and the exit gate decides what
//! the signals mean.

use std::sync::LazyLock;

use regex::Regex;

static COMPLETION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\ball (?:the )?tasks (?:are |have been )?(?:now )?(?:complete|completed|done|finished)\b",
        r"(?i)\bnothing (?:left|more|else|remaining) to (?:do|implement)\b",
        r"(?i)\bproject (?:is )?(?:now )?(?:complete|completed|finished|done)\b",
        r"(?i)\ball (?:items|work|requirements) (?:is |are |have been )?(?:now )?(?:complete|completed|done|finished)\b",
        r"(?i)\bimplementation is (?:now )?(?:complete|finished|done)\b",
        r"(?i)\bno (?:remaining|outstanding|further) (?:tasks|work|items)\b",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Stage 1: tokens that indicate an error on a line.
static ERROR_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ix)
        \berrors?\b"?\s*[:=\[]
        | ^\s*(?:fatal|exception|panic)\b
        | \bpanicked\ at\b
        | \btraceback\ \(most\ recent\ call\ last\)
        | \b\w+(?:Error|Exception):
        | \bcommand\ failed\b
        | \bfailed\ with\ exit\ code\b
        "#,
    )
    .unwrap()
});

/// Stage 2: spans that mention "error" without reporting one.
static BENIGN_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ix)
        "?\w*errors?\w*"?\s*[:=]\s*(?:false|null|none|0|\[\s*\]|\{\s*\}|""|'')
        | "?\w+_errors?"?\s*[:=]\s*\S+
        | "?errors?_\w+"?\s*[:=]\s*\S+
        | \b(?:no|zero|0|without)\ errors?\b
        "#,
    )
    .unwrap()
});

/// Lines that continue a multi-line error report (stack frames, compiler notes).
static CONTINUATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\s+at\s|\s+File\s|\s*Caused by\b|\s*\|(?:\s|$)|\s*\d+\s*\||\s*-->\s|\s*= (?:note|help):|\s+\^|\s{4,}\S)",
    )
    .unwrap()
});

static PERMISSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bpermission (?:was |has been )?denied\b",
        r"(?i)\bnot (?:allowed|permitted) to use\b",
        r"(?i)\btool (?:use |call )?(?:was )?(?:denied|rejected|blocked)\b",
        r"(?i)\brequires? (?:approval|permission) to (?:run|use|execute)\b",
        r"(?i)\bhaven't granted\b",
        r"(?i)\bblocked by (?:the )?allowed ?tools\b",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static TEST_WORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:running (?:the )?tests|ran (?:the )?tests|cargo test|npm (?:run )?test|pytest|go test|bats\b|test suite|all tests pass(?:ed)?|tests? (?:are )?passing)",
    )
    .unwrap()
});

static IMPLEMENTATION_WORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:implement(?:ed|ing)?|creat(?:ed|ing) (?:a |the )?(?:file|function|module|struct|class)|add(?:ed|ing) (?:a |the )?(?:feature|function|endpoint|module|support)|refactor(?:ed|ing)?|fix(?:ed|ing) (?:the )?(?:bug|issue)|wrote (?:the )?(?:code|function|module))",
    )
    .unwrap()
});

static API_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:usage limit (?:reached|exceeded)|5-hour limit|(?:api )?rate limit (?:reached|exceeded)|out of (?:extra )?usage|limit will reset)",
    )
    .unwrap()
});

/// Count completion phrases. Every match adds one to the confidence counter.
pub fn count_completion_indicators(text: &str) -> u32 {
    COMPLETION_PATTERNS
        .iter()
        .map(|re| re.find_iter(text).count() as u32)
        .sum()
}

/// Result of two-stage error scanning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorScan {
    /// Logical error occurrences (a multi-line block counts once).
    pub occurrences: u32,
    /// First line of the first occurrence.
    pub first: Option<String>,
}

/// Scan text for errors.
///
/// Stage 1 flags lines containing an error token. Stage 2 removes spans that
/// only name an error field (`"has_errors": false`, `error_count=0`, `no errors`)
/// and re-checks the remainder. Consecutive flagged lines and stack-trace
/// continuation lines collapse into a single occurrence.
pub fn scan_errors(text: &str) -> ErrorScan {
    let mut scan = ErrorScan::default();
    let mut in_block = false;

    for line in text.lines() {
        if is_error_line(line) {
            if !in_block {
                scan.occurrences += 1;
                if scan.first.is_none() {
                    scan.first = Some(line.trim().chars().take(200).collect());
                }
            }
            in_block = true;
            continue;
        }
        if in_block && CONTINUATION_RE.is_match(line) {
            continue;
        }
        in_block = false;
    }
    scan
}

fn is_error_line(line: &str) -> bool {
    if !ERROR_TOKEN_RE.is_match(line) {
        return false;
    }
    let remainder = BENIGN_ERROR_RE.replace_all(line, " ");
    ERROR_TOKEN_RE.is_match(&remainder)
}

/// True when the text contains tool-permission denial phrasing.
pub fn has_permission_denial(text: &str) -> bool {
    PERMISSION_PATTERNS.iter().any(|re| re.is_match(text))
}

/// True when the narrative mentions running tests but no implementation work.
pub fn is_test_only_work(text: &str) -> bool {
    TEST_WORK_RE.is_match(text) && !IMPLEMENTATION_WORK_RE.is_match(text)
}

/// True when the text reports the agent provider's usage limit.
pub fn mentions_api_limit(text: &str) -> bool {
    API_LIMIT_RE.is_match(text)
}
