//! Error signatures
//!
//! A signature is a deterministic hash identifying "the same error". Volatile
//! tokens (line numbers, addresses) are stripped before hashing so the same
//! underlying problem produces the same signature across sessions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of an error, derived from its message and the
/// surrounding code context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Compute the signature for an error message plus code context.
    pub fn compute(error_message: &str, code_context: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize(error_message).as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize(code_context).as_bytes());
        Self(hex_digest(hasher))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ErrorSignature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Collapse whitespace and strip tokens that vary between runs of the same
/// failure: line/column numbers and hex addresses.
fn normalize(text: &str) -> String {
    let line_re = regex::Regex::new(r"(?i)\bline\s+\d+").unwrap();
    let addr_re = regex::Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let collapsed = line_re.replace_all(&collapsed, "line N");
    let collapsed = addr_re.replace_all(&collapsed, "0xADDR");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let a = ErrorSignature::compute("AssertionError: 1 != 2", "assert 1 == 2");
        let b = ErrorSignature::compute("AssertionError: 1 != 2", "assert 1 == 2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_differs_on_message() {
        let a = ErrorSignature::compute("AssertionError: 1 != 2", "ctx");
        let b = ErrorSignature::compute("AssertionError: 1 != 3", "ctx");
        assert_ne!(a, b);
    }

    #[test]
    fn test_line_numbers_do_not_change_signature() {
        let a = ErrorSignature::compute("error at line 10 in foo", "ctx");
        let b = ErrorSignature::compute("error at line 42 in foo", "ctx");
        assert_eq!(a, b);
    }

    #[test]
    fn test_addresses_do_not_change_signature() {
        let a = ErrorSignature::compute("object at 0xdeadbeef", "ctx");
        let b = ErrorSignature::compute("object at 0xcafebabe", "ctx");
        assert_eq!(a, b);
    }

    #[test]
    fn test_whitespace_is_collapsed() {
        let a = ErrorSignature::compute("a  b\n\tc", "ctx");
        let b = ErrorSignature::compute("a b c", "ctx");
        assert_eq!(a, b);
    }
}
