use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Fatal,
}

/// Location of a compiler message, so the editor can jump to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // Windows paths carry a drive letter, hence the optional `X:` prefix.
            Regex::new(
                r"^\s*((?:[A-Za-z]:)?[^:]+):(\d+):(\d+):\s*(fatal error|error|warning):\s*(.*)$",
            )
            .ok()
        })
        .as_ref()
}

pub fn parse_diagnostic(line: &str) -> Option<Diagnostic> {
    let caps = pattern()?.captures(line)?;
    let severity = match &caps[4] {
        "fatal error" => Severity::Fatal,
        "error" => Severity::Error,
        _ => Severity::Warning,
    };
    Some(Diagnostic {
        file: caps[1].trim().to_string(),
        line: caps[2].parse().ok()?,
        column: caps[3].parse().ok()?,
        severity,
        message: caps[5].trim().to_string(),
    })
}
