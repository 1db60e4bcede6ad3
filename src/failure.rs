//! Test failure parsing
//!
//! Turns the executor's combined stdout/stderr into structured `Failure`
//! records. A primary anchored pattern extracts `file::test - message`;
//! when it matches nothing, a secondary scan picks up bare `FAILED` lines
//! and splits on " - ".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Classified kind of a test failure, derived from the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// `'X' object has no attribute 'y'`
    MissingAttribute,
    /// `AssertionError: A != B`
    AssertionMismatch,
    /// `No module named 'm'`
    ImportError,
    /// `f() missing N required positional arguments`
    MissingArguments,
    /// Tabs/spaces mixing
    Indentation,
    /// Anything the catalogue does not cover
    Other,
}

impl ErrorKind {
    pub fn classify(message: &str) -> Self {
        if message.contains("object has no attribute") {
            ErrorKind::MissingAttribute
        } else if message.contains("AssertionError") {
            ErrorKind::AssertionMismatch
        } else if message.contains("No module named") || message.contains("ImportError") {
            ErrorKind::ImportError
        } else if message.contains("TypeError") && message.contains("missing") {
            ErrorKind::MissingArguments
        } else if message.contains("IndentationError") {
            ErrorKind::Indentation
        } else {
            ErrorKind::Other
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::MissingAttribute => "missing_attribute",
            ErrorKind::AssertionMismatch => "assertion_mismatch",
            ErrorKind::ImportError => "import_error",
            ErrorKind::MissingArguments => "missing_arguments",
            ErrorKind::Indentation => "indentation",
            ErrorKind::Other => "other",
        }
    }
}

/// One failing test, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Path of the file the failure was reported against.
    pub file: String,
    /// Failing test name; empty when the output did not carry one.
    pub test: String,
    pub kind: ErrorKind,
    pub message: String,
    /// The raw line the failure was extracted from.
    pub raw_location: String,
}

/// Parser over the executor's combined output.
pub struct FailureParser {
    pattern: regex::Regex,
}

impl Default for FailureParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureParser {
    pub fn new() -> Self {
        Self {
            pattern: regex::Regex::new(r"(?m)^FAILED\s+([^\s:]+)::(\S+)\s*-\s*(.+)$")
                .expect("failure pattern is valid"),
        }
    }

    /// Parse failures in order of first appearance. Duplicates (same
    /// file+test+message) collapse. Empty or non-matching input yields an
    /// empty list.
    pub fn parse(&self, output: &str) -> Vec<Failure> {
        if output.trim().is_empty() {
            return Vec::new();
        }

        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for caps in self.pattern.captures_iter(output) {
            let file = caps[1].trim().to_string();
            let test = caps[2].trim().to_string();
            let message = caps[3].trim().to_string();
            push_unique(&mut failures, &mut seen, file, test, message, &caps[0]);
        }

        if failures.is_empty() {
            // Secondary scan: bare FAILED lines without the :: anchor.
            for line in output.lines() {
                if !line.contains("FAILED") {
                    continue;
                }
                let mut parts = line.splitn(2, " - ");
                let head = parts.next().unwrap_or("").trim();
                let Some(message) = parts.next() else {
                    continue;
                };
                let head = head.trim_start_matches("FAILED").trim();
                let (file, test) = match head.split_once("::") {
                    Some((f, t)) => (f.to_string(), t.to_string()),
                    None => (head.to_string(), String::new()),
                };
                if file.is_empty() {
                    continue;
                }
                push_unique(
                    &mut failures,
                    &mut seen,
                    file,
                    test,
                    message.trim().to_string(),
                    line,
                );
            }
        }

        failures
    }
}

fn push_unique(
    failures: &mut Vec<Failure>,
    seen: &mut HashSet<(String, String, String)>,
    file: String,
    test: String,
    message: String,
    raw: &str,
) {
    let key = (file.clone(), test.clone(), message.clone());
    if !seen.insert(key) {
        return;
    }
    failures.push(Failure {
        kind: ErrorKind::classify(&message),
        file,
        test,
        message,
        raw_location: raw.trim().to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_pattern() {
        let out = "FAILED tests/test_math.py::test_add - AssertionError: 1 != 2\n";
        let parser = FailureParser::new();
        let failures = parser.parse(out);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "tests/test_math.py");
        assert_eq!(failures[0].test, "test_add");
        assert_eq!(failures[0].kind, ErrorKind::AssertionMismatch);
    }

    #[test]
    fn test_secondary_scan_without_test_name() {
        let out = "FAILED tests/test_io.py - ImportError: No module named 'math'\n";
        let parser = FailureParser::new();
        let failures = parser.parse(out);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "tests/test_io.py");
        assert_eq!(failures[0].test, "");
        assert_eq!(failures[0].kind, ErrorKind::ImportError);
    }

    #[test]
    fn test_duplicates_collapse_and_order_is_stable() {
        let out = "\
FAILED tests/a.py::t1 - AssertionError: 1 != 2
FAILED tests/b.py::t2 - TypeError: f() missing 2 required positional arguments
FAILED tests/a.py::t1 - AssertionError: 1 != 2
";
        let parser = FailureParser::new();
        let failures = parser.parse(out);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].file, "tests/a.py");
        assert_eq!(failures[1].file, "tests/b.py");
        assert_eq!(failures[1].kind, ErrorKind::MissingArguments);
    }

    #[test]
    fn test_empty_input_yields_no_failures() {
        let parser = FailureParser::new();
        assert!(parser.parse("").is_empty());
        assert!(parser.parse("   \n \t ").is_empty());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let out = "FAILED tests/a.py::t - AssertionError: x != y\nFAILED tests/b.py::u - IndentationError: raw\n";
        let parser = FailureParser::new();
        assert_eq!(parser.parse(out), parser.parse(out));
    }

    #[test]
    fn test_kind_classification_covers_catalogue() {
        assert_eq!(
            ErrorKind::classify("AttributeError: 'X' object has no attribute 'y'"),
            ErrorKind::MissingAttribute
        );
        assert_eq!(
            ErrorKind::classify("AssertionError: 1 != 2"),
            ErrorKind::AssertionMismatch
        );
        assert_eq!(
            ErrorKind::classify("ModuleNotFoundError: No module named 'm'"),
            ErrorKind::ImportError
        );
        assert_eq!(
            ErrorKind::classify("TypeError: f() missing 2 required positional arguments"),
            ErrorKind::MissingArguments
        );
        assert_eq!(
            ErrorKind::classify("IndentationError: unexpected indent"),
            ErrorKind::Indentation
        );
        assert_eq!(ErrorKind::classify("RuntimeError: boom"), ErrorKind::Other);
    }
}
