//! Error-location extraction over arbitrary toolchain output
//!
//! A registry of `(language tag, pattern)` rows. Rows for the hinted stack
//! are tried first, then every other language, and the universal
//! `path:line` pattern is evaluated last.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A diagnosed location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorLocation {
    /// Path as printed by the tool
    pub file: String,
    /// 1-based line
    pub line: u32,
    /// Best-effort message for the location
    pub message: String,
    /// Registry row that matched
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageSource {
    /// The pattern's `msg` group
    Group,
    /// Nearest preceding line mentioning an error or exception
    PrecedingErrorLine,
    /// Final `SomethingError: ...` line of the output
    TrailingException,
    /// The matched line itself
    MatchedLine,
}

#[derive(Debug)]
struct PatternRow {
    language: &'static str,
    regex: Regex,
    message: MessageSource,
}

const UNIVERSAL: &str = "universal";

static ROWS: &[(&str, &str, MessageSource)] = &[
    (
        "python",
        r#"File "(?P<file>[^"<>]+)", line (?P<line>\d+)"#,
        MessageSource::TrailingException,
    ),
    (
        "java",
        r"(?P<file>[\w./-]+\.(?:java|kt|scala)):(?P<line>\d+): (?:error|warning): (?P<msg>.+)",
        MessageSource::Group,
    ),
    (
        "java",
        r"\((?P<file>[\w./$-]+\.(?:java|kt|scala)):(?P<line>\d+)\)",
        MessageSource::PrecedingErrorLine,
    ),
    (
        "node",
        r"(?P<file>[\w./-]+\.tsx?)\((?P<line>\d+),\d+\): error (?P<msg>.+)",
        MessageSource::Group,
    ),
    (
        "node",
        r"\((?P<file>[^()\s]+\.[jt]sx?):(?P<line>\d+):\d+\)",
        MessageSource::PrecedingErrorLine,
    ),
    (
        "node",
        r"at\s+(?P<file>/[^\s:()]+\.[jt]sx?):(?P<line>\d+)",
        MessageSource::PrecedingErrorLine,
    ),
    (
        "rust",
        r"-->\s*(?P<file>[\w./-]+\.rs):(?P<line>\d+)",
        MessageSource::PrecedingErrorLine,
    ),
    (
        "go",
        r"(?P<file>[\w./-]+\.go):(?P<line>\d+)(?::\d+)?: (?P<msg>.+)",
        MessageSource::Group,
    ),
    (
        "dart",
        r"(?P<file>[\w./-]+\.dart):(?P<line>\d+)(?::\d+)?(?::\s*(?P<msg>.+))?",
        MessageSource::Group,
    ),
    (
        UNIVERSAL,
        r"(?P<file>[\w./-]+\.\w{1,10}):(?P<line>\d+)",
        MessageSource::MatchedLine,
    ),
];

static REGISTRY: Lazy<Vec<PatternRow>> = Lazy::new(|| {
    ROWS.iter()
        .filter_map(|(language, pattern, message)| {
            Regex::new(pattern).ok().map(|regex| PatternRow {
                language: *language,
                regex,
                message: *message,
            })
        })
        .collect()
});

static FATAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"Traceback \(most recent call last\)",
        r"thread '[^']*' panicked at",
        r"Segmentation fault",
        r#"Exception in thread ""#,
        r"(?i)unhandled ?promise ?rejection",
        r"(?m)^panic: ",
        r"FATAL ERROR",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static EXCEPTION_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[\w.]*(?:Error|Exception|Exit|Interrupt)\b(?::.*)?$").ok());

/// Stateless extractor over the built-in registry
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorExtractor;

impl ErrorExtractor {
    /// Extractor over the built-in registry
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Ordered, de-duplicated error locations
    ///
    /// Passes stop at the first that yields anything: hinted language,
    /// then all other languages, then the universal fallback.
    #[must_use]
    pub fn extract(&self, output: &str, stack_hint: Option<&str>) -> Vec<ErrorLocation> {
        let lines: Vec<&str> = output.lines().collect();
        let hint = stack_hint.map(str::to_lowercase);

        if let Some(hint) = hint.as_deref() {
            let found = scan(&lines, |row| row.language == hint);
            if !found.is_empty() {
                return found;
            }
        }
        let found = scan(&lines, |row| {
            row.language != UNIVERSAL && Some(row.language) != hint.as_deref()
        });
        if !found.is_empty() {
            return found;
        }
        scan(&lines, |row| row.language == UNIVERSAL)
    }

    /// True when output contains a crash signature regardless of exit code
    #[must_use]
    pub fn has_fatal_pattern(&self, output: &str) -> bool {
        FATAL_PATTERNS.iter().any(|p| p.is_match(output))
    }
}

fn scan(lines: &[&str], select: impl Fn(&PatternRow) -> bool) -> Vec<ErrorLocation> {
    let rows: Vec<&PatternRow> = REGISTRY.iter().filter(|r| select(*r)).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        for row in &rows {
            for caps in row.regex.captures_iter(line) {
                let (Some(file), Some(line_no)) = (caps.name("file"), caps.name("line")) else {
                    continue;
                };
                let Ok(line_no) = line_no.as_str().parse::<u32>() else {
                    continue;
                };
                let file = file.as_str().to_string();
                if !seen.insert((file.clone(), line_no)) {
                    continue;
                }
                let group = caps.name("msg").map(|m| m.as_str().trim().to_string());
                let message = resolve_message(row.message, group, lines, idx);
                out.push(ErrorLocation {
                    file,
                    line: line_no,
                    message,
                    language: row.language.to_string(),
                });
            }
        }
    }
    out
}

fn resolve_message(source: MessageSource, group: Option<String>, lines: &[&str], idx: usize) -> String {
    let matched = lines[idx].trim().to_string();
    match source {
        MessageSource::Group => group.filter(|g| !g.is_empty()).unwrap_or(matched),
        MessageSource::MatchedLine => matched,
        MessageSource::PrecedingErrorLine => lines[..idx]
            .iter()
            .rev()
            .take(6)
            .map(|l| l.trim())
            .find(|l| {
                let lower = l.to_lowercase();
                lower.starts_with("error") || lower.contains("exception") || lower.contains("error:")
            })
            .map_or(matched, str::to_string),
        MessageSource::TrailingException => lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| EXCEPTION_LINE.as_ref().is_some_and(|re| re.is_match(l)))
            .map_or(matched, str::to_string),
    }
}
