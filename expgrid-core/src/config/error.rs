// Configuration error types with helpful error messages
// Provides line/column info, a source excerpt, and suggestions for common mistakes

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A YAML error pinned to a position in the file it came from
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// 1-indexed
    pub line: usize,
    /// 1-indexed; 0 when unknown
    pub column: usize,
    /// Rendered excerpt of the lines around `line`
    pub context: String,
    pub suggestion: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach `radius` lines of `source` on either side of the error line
    pub fn with_source_context(mut self, source: &str, radius: usize) -> Self {
        self.context = excerpt(source, self.line, self.column, radius);
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let raw = err.to_string();
        let (line, column) = match err.location() {
            Some(loc) => (loc.line(), loc.column()),
            None => (1, 1),
        };

        let offending = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
        let parsed = ParseError::new(describe(&raw), line, column).with_source_context(source, 2);
        match suggest_fix(&raw, offending) {
            Some(hint) => parsed.with_suggestion(hint),
            None => parsed,
        }
    }
}

fn excerpt(source: &str, line: usize, column: usize, radius: usize) -> String {
    let first = line.saturating_sub(radius).max(1);
    let last = line + radius;

    let mut out = String::new();
    for (number, text) in (1..).zip(source.lines()) {
        if number < first || number > last {
            continue;
        }
        let marker = if number == line { '>' } else { ' ' };
        out.push_str(&format!("{} {:4} | {}\n", marker, number, text));
        if number == line && column > 0 {
            out.push_str(&format!("       | {:>width$}\n", "^", width = column));
        }
    }
    out
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n  --> line {}:{}\n", self.message, self.line, self.column)?;
        if !self.context.is_empty() {
            write!(f, "\n{}", self.context)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}\n", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Errors loading the workspace or settings files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("{path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Rephrase the common serde messages; anything else passes through
fn describe(msg: &str) -> String {
    if let Some(field) = extract_between(msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        let mut text = format!("unknown field '{}'", field);
        if let Some(rest) = msg.split_once("expected one of ").map(|(_, r)| r) {
            let list = rest.split(" at line").next().unwrap_or(rest);
            text.push_str(", expected one of: ");
            text.push_str(&list.replace('`', ""));
        }
        return text;
    }

    let found = extract_between(msg, "invalid type: ", ", expected");
    let expected = extract_between(msg, "expected ", " at");
    if let (Some(found), Some(expected)) = (found, expected) {
        return format!("expected {}, but found {}", expected, found);
    }

    msg.to_string()
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let (_, tail) = msg.split_once(prefix)?;
    let (inner, _) = tail.split_once(suffix)?;
    Some(inner.to_string())
}

const TYPOS: &[(&str, &str)] = &[
    ("matrixes", "matrices"),
    ("variable:", "variables"),
    ("zip:", "zips"),
    ("experiment:", "experiments"),
    ("workload:", "workloads"),
    ("n_repeat:", "n_repeats"),
    ("workflow-manager", "workflow_manager"),
    ("dependson", "depends_on"),
];

fn suggest_fix(msg: &str, offending: &str) -> Option<String> {
    if msg.contains("missing field `workspace`") {
        return Some("the file must start with a top-level 'workspace:' section".to_string());
    }
    if offending.starts_with('\t') {
        return Some("indent with spaces; YAML rejects tabs".to_string());
    }

    let lowered = offending.to_lowercase();
    TYPOS
        .iter()
        .find(|(typo, _)| lowered.contains(typo))
        .map(|(_, correct)| format!("did you mean '{}'?", correct))
}
