//! Patch tracker
//!
//! Append-only ledgers recording every attempt and outcome: failed patches,
//! successful patches, import fixes, oracle feedback, and daily performance
//! roll-ups. Historical entries are never mutated; corrections are new
//! entries. Corrupt ledger files are quarantined and recreated empty.

use crate::patch::Provenance;
use crate::signature::ErrorSignature;
use crate::store::{quarantine, write_atomic};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PATCH_DATA_DIR: &str = "patch_data";
const FAILED_FILE: &str = "failed_patches.json";
const SUCCESSFUL_FILE: &str = "successful_patches.json";
const IMPORT_FIXES_FILE: &str = "import_fixes.json";
const ORACLE_FEEDBACK_FILE: &str = "oracle_feedback.json";
const PERFORMANCE_FILE: &str = "performance.json";

/// Final state of one patch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    AppliedAndPassed,
    AppliedAndFailed,
    RejectedByGate,
    RolledBack,
    ManualReview,
}

impl AttemptStatus {
    pub fn name(&self) -> &'static str {
        match self {
            AttemptStatus::AppliedAndPassed => "applied_and_passed",
            AttemptStatus::AppliedAndFailed => "applied_and_failed",
            AttemptStatus::RejectedByGate => "rejected_by_gate",
            AttemptStatus::RolledBack => "rolled_back",
            AttemptStatus::ManualReview => "manual_review",
        }
    }
}

/// One ledger entry. `seq` is a monotonic sequence number that totally
/// orders entries alongside the timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub seq: u64,
    pub patch: String,
    pub provenance: Provenance,
    pub status: AttemptStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-module import fix counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImportFixStats {
    pub fixed: u32,
    pub failed: u32,
}

/// Record of one oracle invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleFeedback {
    pub seq: u64,
    pub signature: ErrorSignature,
    pub provider: String,
    pub attempt: u32,
    pub accepted: bool,
    pub validation_score: Option<f64>,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

/// Daily roll-up of fix activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyPerformance {
    pub total_fixes: u32,
    pub success_rate: f64,
    pub feedback_summary: String,
}

pub struct PatchTracker {
    dir: PathBuf,
    failed: BTreeMap<ErrorSignature, Vec<AttemptOutcome>>,
    successful: BTreeMap<ErrorSignature, Vec<AttemptOutcome>>,
    import_fixes: BTreeMap<String, ImportFixStats>,
    oracle_feedback: Vec<OracleFeedback>,
    performance: BTreeMap<String, DailyPerformance>,
    seq: u64,
}

impl PatchTracker {
    pub fn load(data_dir: &Path) -> Self {
        let dir = data_dir.join(PATCH_DATA_DIR);
        let failed: BTreeMap<ErrorSignature, Vec<AttemptOutcome>> =
            load_ledger(&dir.join(FAILED_FILE));
        let successful: BTreeMap<ErrorSignature, Vec<AttemptOutcome>> =
            load_ledger(&dir.join(SUCCESSFUL_FILE));
        let import_fixes = load_ledger(&dir.join(IMPORT_FIXES_FILE));
        let oracle_feedback: Vec<OracleFeedback> = load_ledger(&dir.join(ORACLE_FEEDBACK_FILE));
        let performance = load_ledger(&dir.join(PERFORMANCE_FILE));

        let seq = failed
            .values()
            .chain(successful.values())
            .flatten()
            .map(|o| o.seq)
            .chain(oracle_feedback.iter().map(|f| f.seq))
            .max()
            .unwrap_or(0);

        Self {
            dir,
            failed,
            successful,
            import_fixes,
            oracle_feedback,
            performance,
            seq,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn record_failed(
        &mut self,
        signature: &ErrorSignature,
        patch: &str,
        provenance: Provenance,
        status: AttemptStatus,
        reason: &str,
    ) -> Result<()> {
        let outcome = AttemptOutcome {
            seq: self.next_seq(),
            patch: patch.to_string(),
            provenance,
            status,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        };
        self.failed.entry(signature.clone()).or_default().push(outcome);
        info!("recorded {} patch for {}", status.name(), signature.short());
        save_ledger(&self.dir.join(FAILED_FILE), &self.failed)
    }

    pub fn record_successful(
        &mut self,
        signature: &ErrorSignature,
        patch: &str,
        provenance: Provenance,
    ) -> Result<()> {
        let outcome = AttemptOutcome {
            seq: self.next_seq(),
            patch: patch.to_string(),
            provenance,
            status: AttemptStatus::AppliedAndPassed,
            reason: None,
            timestamp: Utc::now(),
        };
        self.successful
            .entry(signature.clone())
            .or_default()
            .push(outcome);
        info!("recorded successful patch for {}", signature.short());
        save_ledger(&self.dir.join(SUCCESSFUL_FILE), &self.successful)
    }

    pub fn record_import_fix(&mut self, module: &str, fixed: bool) -> Result<()> {
        let stats = self.import_fixes.entry(module.to_string()).or_default();
        if fixed {
            stats.fixed += 1;
        } else {
            stats.failed += 1;
        }
        save_ledger(&self.dir.join(IMPORT_FIXES_FILE), &self.import_fixes)
    }

    pub fn record_oracle_feedback(
        &mut self,
        signature: &ErrorSignature,
        provider: &str,
        attempt: u32,
        accepted: bool,
        validation_score: Option<f64>,
        rationale: &str,
    ) -> Result<()> {
        let entry = OracleFeedback {
            seq: self.next_seq(),
            signature: signature.clone(),
            provider: provider.to_string(),
            attempt,
            accepted,
            validation_score,
            rationale: rationale.to_string(),
            timestamp: Utc::now(),
        };
        self.oracle_feedback.push(entry);
        save_ledger(&self.dir.join(ORACLE_FEEDBACK_FILE), &self.oracle_feedback)
    }

    /// Roll today's totals into the performance ledger.
    pub fn roll_up_performance(&mut self) -> Result<DailyPerformance> {
        let today = Utc::now().date_naive().to_string();
        let import_fixed: u32 = self.import_fixes.values().map(|s| s.fixed).sum();
        let import_failed: u32 = self.import_fixes.values().map(|s| s.failed).sum();
        let succeeded = self.successful.values().map(|v| v.len() as u32).sum::<u32>();
        let failed = self.failed.values().map(|v| v.len() as u32).sum::<u32>();
        let total = succeeded + failed;
        let success_rate = if total > 0 {
            (succeeded as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        let oracle_accepted = self.oracle_feedback.iter().filter(|f| f.accepted).count();
        let entry = DailyPerformance {
            total_fixes: total,
            success_rate,
            feedback_summary: format!(
                "{} oracle suggestions accepted of {}; imports fixed {} / failed {}",
                oracle_accepted,
                self.oracle_feedback.len(),
                import_fixed,
                import_failed
            ),
        };
        self.performance.insert(today, entry.clone());
        save_ledger(&self.dir.join(PERFORMANCE_FILE), &self.performance)?;
        Ok(entry)
    }

    pub fn failed_for(&self, signature: &ErrorSignature) -> &[AttemptOutcome] {
        self.failed.get(signature).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn successful_for(&self, signature: &ErrorSignature) -> &[AttemptOutcome] {
        self.successful
            .get(signature)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// (passed, total) attempt counts per signature, for confidence priming.
    pub fn attempt_tallies(&self) -> BTreeMap<ErrorSignature, (u32, u32)> {
        let mut tallies: BTreeMap<ErrorSignature, (u32, u32)> = BTreeMap::new();
        for (sig, outcomes) in &self.successful {
            let entry = tallies.entry(sig.clone()).or_default();
            entry.0 += outcomes.len() as u32;
            entry.1 += outcomes.len() as u32;
        }
        for (sig, outcomes) in &self.failed {
            let counted = outcomes
                .iter()
                .filter(|o| o.status != AttemptStatus::ManualReview)
                .count() as u32;
            tallies.entry(sig.clone()).or_default().1 += counted;
        }
        tallies
    }

    pub fn import_fix_stats(&self) -> &BTreeMap<String, ImportFixStats> {
        &self.import_fixes
    }

    pub fn performance(&self) -> &BTreeMap<String, DailyPerformance> {
        &self.performance
    }

    pub fn oracle_feedback(&self) -> &[OracleFeedback] {
        &self.oracle_feedback
    }

    /// Most recent attempts across both attempt ledgers, newest first.
    pub fn recent_attempts(&self, limit: usize) -> Vec<(ErrorSignature, AttemptOutcome)> {
        let mut all: Vec<(ErrorSignature, AttemptOutcome)> = Vec::new();
        for (sig, outcomes) in self.failed.iter().chain(self.successful.iter()) {
            for outcome in outcomes {
                all.push((sig.clone(), outcome.clone()));
            }
        }
        all.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));
        all.truncate(limit);
        all
    }
}

fn load_ledger<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    "ledger {} corrupted ({}); quarantining and starting empty",
                    path.display(),
                    err
                );
                quarantine(path);
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

fn save_ledger<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(data)?;
    write_atomic(path, &content)
}
