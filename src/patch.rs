//! Unified diff parsing and application
//!
//! Handles parsing unified diff format, applying hunks to file content, and
//! the `Patch` artifact the engine passes between components.

use crate::signature::ErrorSignature;
use serde::{Deserialize, Serialize};

/// Origin of a candidate patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Learned,
    Pattern,
    Oracle,
}

impl Provenance {
    pub fn name(&self) -> &'static str {
        match self {
            Provenance::Learned => "learned",
            Provenance::Pattern => "pattern",
            Provenance::Oracle => "oracle",
        }
    }
}

/// A candidate fix: the diff text plus where it came from and which error
/// it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub diff: String,
    pub provenance: Provenance,
    pub signature: ErrorSignature,
}

impl Patch {
    pub fn new(diff: String, provenance: Provenance, signature: ErrorSignature) -> Self {
        Self {
            diff,
            provenance,
            signature,
        }
    }

    /// Paths this patch mutates, in diff order.
    pub fn targets(&self) -> Vec<String> {
        match parse_patch(&self.diff) {
            Ok(diffs) => diffs.into_iter().map(|d| d.new_path).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

/// One file's worth of a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

/// Parse a unified diff that may span several files.
pub fn parse_patch(diff: &str) -> Result<Vec<FileDiff>, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !lines[i].starts_with("--- ") {
            i += 1;
            continue;
        }
        let old_path = strip_diff_path(&lines[i][4..], "a/");
        i += 1;
        if i >= lines.len() || !lines[i].starts_with("+++ ") {
            return Err(format!("missing +++ line after --- {}", old_path));
        }
        let new_path = strip_diff_path(&lines[i][4..], "b/");
        i += 1;

        let mut hunks = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@ ") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        }
        if hunks.is_empty() {
            return Err(format!("no hunks for {}", new_path));
        }
        out.push(FileDiff {
            old_path,
            new_path,
            hunks,
        });
    }

    if out.is_empty() {
        return Err("no file headers found in diff".to_string());
    }
    Ok(out)
}

fn strip_diff_path(raw: &str, prefix: &str) -> String {
    let mut path = raw.trim_start_matches(prefix).to_string();
    // Drop a timestamp suffix if present
    if let Some(tab) = path.find('\t') {
        path.truncate(tab);
    }
    path.trim().to_string()
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<Hunk, String> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(format!("invalid hunk header: {}", header));
    }
    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;
    *idx += 1;

    let mut hunk_lines = Vec::new();
    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@ ") || line.starts_with("--- ") || line.starts_with("diff ") {
            break;
        }
        if let Some(rest) = line.strip_prefix('+') {
            hunk_lines.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk_lines.push(DiffLine::Remove(rest.to_string()));
        } else if line.is_empty() {
            hunk_lines.push(DiffLine::Context(String::new()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk_lines.push(DiffLine::Context(rest.to_string()));
        }
        // Anything else ("\ No newline at end of file") is skipped.
        *idx += 1;
    }

    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: hunk_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    match s.split_once(',') {
        Some((start, count)) => {
            let start = start
                .parse()
                .map_err(|_| format!("invalid start: {}", s))?;
            let count = count
                .parse()
                .map_err(|_| format!("invalid count: {}", s))?;
            Ok((start, count))
        }
        None => {
            let start = s
                .parse()
                .map_err(|_| format!("invalid line number: {}", s))?;
            Ok((start, 1))
        }
    }
}

/// Apply one file's hunks to its original content. Hunks apply in reverse
/// order so earlier line numbers stay valid.
pub fn apply_file_diff(original: &str, diff: &FileDiff) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();
    for hunk in diff.hunks.iter().rev() {
        lines = apply_hunk(lines, hunk)?;
    }
    let mut out = lines.join("\n");
    if original.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn apply_hunk(mut lines: Vec<String>, hunk: &Hunk) -> Result<Vec<String>, String> {
    let start = hunk.old_start.saturating_sub(1);
    if start > lines.len() {
        return Err(format!(
            "hunk start {} is past end of file ({} lines)",
            hunk.old_start,
            lines.len()
        ));
    }

    let mut replacement = Vec::new();
    let mut consumed = 0;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(s) => {
                replacement.push(s.clone());
                consumed += 1;
            }
            DiffLine::Add(s) => replacement.push(s.clone()),
            DiffLine::Remove(_) => consumed += 1,
        }
    }

    let end = (start + consumed).min(lines.len());
    lines.splice(start..end, replacement);
    Ok(lines)
}

/// Build a whole-file replacement diff. Used when a fix was computed directly
/// on the content (pattern fixes) and needs a diff artifact for the ledgers
/// and the learned store.
pub fn full_file_diff(path: &str, old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let mut out = format!("--- a/{}\n+++ b/{}\n", path, path);
    out.push_str(&format!(
        "@@ -1,{} +1,{} @@\n",
        old_lines.len(),
        new_lines.len()
    ));
    for line in &old_lines {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}
