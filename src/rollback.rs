//! Rollback manager
//!
//! Orchestrates per-file restore after a failed patch and the alternate-order
//! retry pass: before a signature is abandoned, previously failed patches are
//! re-tried in reverse of their original try order, to catch interaction
//! bugs with fixes applied since. Budgets are per signature.

use crate::patch::Patch;
use crate::signature::ErrorSignature;
use crate::tracker::{AttemptStatus, PatchTracker};
use crate::vault::BackupVault;
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub struct RollbackManager {
    max_retries: u32,
    retry_counts: HashMap<ErrorSignature, u32>,
}

impl RollbackManager {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_counts: HashMap::new(),
        }
    }

    /// Restore the files a failed patch touched and record the outcome.
    pub fn revert_patch(
        &mut self,
        project_root: &Path,
        patch: &Patch,
        vault: &mut BackupVault,
        tracker: &mut PatchTracker,
        status: AttemptStatus,
        reason: &str,
    ) -> Result<()> {
        for target in patch.targets() {
            let path = project_root.join(&target);
            vault.restore(&path)?;
        }
        tracker.record_failed(&patch.signature, &patch.diff, patch.provenance, status, reason)?;
        info!(
            "reverted {} patch for {}: {}",
            patch.provenance.name(),
            patch.signature.short(),
            reason
        );
        Ok(())
    }

    /// Previously applied-and-failed patches for the signature, in reverse
    /// of their original try order, deduplicated. Gate rejections and
    /// manual-review markers are not retried.
    pub fn alternate_candidates(
        &self,
        signature: &ErrorSignature,
        tracker: &PatchTracker,
    ) -> Vec<(String, crate::patch::Provenance)> {
        let mut seen = std::collections::HashSet::new();
        tracker
            .failed_for(signature)
            .iter()
            .rev()
            .filter(|o| {
                matches!(
                    o.status,
                    AttemptStatus::AppliedAndFailed | AttemptStatus::RolledBack
                ) && !o.patch.is_empty()
            })
            .filter(|o| seen.insert(o.patch.clone()))
            .map(|o| (o.patch.clone(), o.provenance))
            .collect()
    }

    /// Take one retry from the signature's budget. False once exhausted.
    pub fn take_retry(&mut self, signature: &ErrorSignature) -> bool {
        let count = self.retry_counts.entry(signature.clone()).or_insert(0);
        if *count >= self.max_retries {
            return false;
        }
        *count += 1;
        true
    }

    pub fn retries_used(&self, signature: &ErrorSignature) -> u32 {
        self.retry_counts.get(signature).copied().unwrap_or(0)
    }

    /// Mark a signature as needing a human: budget exhausted, no further
    /// escalation.
    pub fn abandon(
        &mut self,
        signature: &ErrorSignature,
        tracker: &mut PatchTracker,
        reason: &str,
    ) {
        warn!("abandoning {}: {}", signature.short(), reason);
        if let Err(err) = tracker.record_failed(
            signature,
            "",
            crate::patch::Provenance::Pattern,
            AttemptStatus::ManualReview,
            reason,
        ) {
            warn!("could not record manual-review marker: {}", err);
        }
    }
}
