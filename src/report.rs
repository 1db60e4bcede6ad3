//! Session reporting
//!
//! Merges per-session tracker deltas into the durable `debugging_report.json`
//! and exposes read views for the CLI. An optional artifact sink may consume
//! the finished report; its absence or failure never fails the session.

use crate::store::{quarantine, write_atomic};
use crate::tracker::{DailyPerformance, PatchTracker};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const REPORT_FILE: &str = "debugging_report.json";

/// Final per-signature disposition for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Fixed,
    ManualReview,
    Aborted,
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Disposition::Fixed => "FIXED",
            Disposition::ManualReview => "MANUAL_REVIEW",
            Disposition::Aborted => "ABORTED",
        }
    }
}

/// The durable report document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DebugReport {
    /// Signature -> human-readable reason the last patch failed.
    #[serde(default)]
    pub failed_patches: BTreeMap<String, String>,
    /// Signature -> oracle rationales collected across sessions.
    #[serde(default)]
    pub oracle_rationales: BTreeMap<String, Vec<String>>,
    /// Signature -> final disposition from the most recent session that saw it.
    #[serde(default)]
    pub dispositions: BTreeMap<String, Disposition>,
    /// Date -> aggregate performance.
    #[serde(default)]
    pub performance: BTreeMap<String, DailyPerformance>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Consumes a finished report (mail, chat, file, ...).
pub trait ArtifactSink {
    fn name(&self) -> &str;
    fn deliver(&self, report: &DebugReport) -> Result<()>;
}

pub struct Reporter {
    path: PathBuf,
    report: DebugReport,
}

impl Reporter {
    /// Load the durable report; a corrupt document is quarantined and the
    /// report starts empty.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(REPORT_FILE);
        let report = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(report) => report,
                Err(err) => {
                    warn!("debugging report corrupted ({}); starting empty", err);
                    quarantine(&path);
                    DebugReport::default()
                }
            },
            Err(_) => DebugReport::default(),
        };
        Self { path, report }
    }

    pub fn log_failed_patch(&mut self, signature: &str, reason: &str) {
        self.report
            .failed_patches
            .insert(signature.to_string(), reason.to_string());
    }

    pub fn set_disposition(&mut self, signature: &str, disposition: Disposition) {
        self.report
            .dispositions
            .insert(signature.to_string(), disposition);
    }

    /// Pull oracle rationales and the daily roll-up out of the tracker.
    pub fn merge_tracker(&mut self, tracker: &PatchTracker) {
        for feedback in tracker.oracle_feedback() {
            let entry = self
                .report
                .oracle_rationales
                .entry(feedback.signature.to_string())
                .or_default();
            let line = format!("{}: {}", feedback.provider, feedback.rationale);
            if !entry.contains(&line) {
                entry.push(line);
            }
        }
        for (date, perf) in tracker.performance() {
            self.report.performance.insert(date.clone(), perf.clone());
        }
    }

    /// Persist the merged report and hand it to the sink, if any.
    pub fn finalize(&mut self, sink: Option<&dyn ArtifactSink>) -> Result<()> {
        self.report.updated_at = Some(Utc::now());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.report)?;
        write_atomic(&self.path, &content)?;
        info!("debugging report saved: {}", self.path.display());

        if let Some(sink) = sink {
            if let Err(err) = sink.deliver(&self.report) {
                warn!("artifact sink {} failed: {}", sink.name(), err);
            }
        }
        Ok(())
    }

    pub fn report(&self) -> &DebugReport {
        &self.report
    }

    /// Human-readable session summary for stdout.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let fixed = self
            .report
            .dispositions
            .values()
            .filter(|d| **d == Disposition::Fixed)
            .count();
        let manual = self
            .report
            .dispositions
            .values()
            .filter(|d| **d == Disposition::ManualReview)
            .count();
        out.push_str(&format!(
            "Signatures fixed: {}  needing manual review: {}\n",
            fixed, manual
        ));
        for (sig, disposition) in &self.report.dispositions {
            out.push_str(&format!("  {}  {}\n", &sig[..sig.len().min(12)], disposition.name()));
        }
        out
    }
}
