//! Learned-fix store
//!
//! Persistent map from error signature to a patch that fixed it before.
//! Loaded once on start, rewritten atomically after each mutation. Only
//! patches observed to pass revalidation are inserted or reinforced.

use crate::signature::ErrorSignature;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const STORE_FILE: &str = "learning_db.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedFix {
    pub patch: String,
    pub success_count: u32,
    pub last_used: DateTime<Utc>,
}

pub struct LearnedFixStore {
    path: PathBuf,
    entries: BTreeMap<ErrorSignature, LearnedFix>,
}

impl LearnedFixStore {
    /// Load the store from the data directory. Malformed persistence resets
    /// to empty (the corrupt bytes are kept under a timestamped name) and
    /// never fails the loop.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(STORE_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("learned-fix store corrupted ({}); resetting to empty", err);
                    quarantine(&path);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn lookup(&self, signature: &ErrorSignature) -> Option<&LearnedFix> {
        self.entries.get(signature)
    }

    /// Insert or replace the patch for a signature. Called only after an
    /// applied-and-passed outcome.
    pub fn upsert(&mut self, signature: &ErrorSignature, patch: &str) -> Result<()> {
        let now = Utc::now();
        self.entries
            .entry(signature.clone())
            .and_modify(|fix| {
                if fix.patch != patch {
                    fix.patch = patch.to_string();
                    fix.success_count = 1;
                } else {
                    fix.success_count = fix.success_count.saturating_add(1);
                }
                fix.last_used = now;
            })
            .or_insert_with(|| LearnedFix {
                patch: patch.to_string(),
                success_count: 1,
                last_used: now,
            });
        self.save()
    }

    /// Bump the success counter for a signature whose stored patch worked
    /// again.
    pub fn reinforce(&mut self, signature: &ErrorSignature) -> Result<()> {
        if let Some(fix) = self.entries.get_mut(signature) {
            fix.success_count = fix.success_count.saturating_add(1);
            fix.last_used = Utc::now();
            self.save()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        write_atomic(&self.path, &content)
    }
}

/// Write-to-temp then rename, so the file on disk is always valid JSON.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

/// Move a corrupt file aside under a timestamp-suffixed name.
pub fn quarantine(path: &Path) {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let quarantined = path.with_file_name(format!("{}.{}.corrupt", name, stamp));
    if fs::rename(path, &quarantined).is_err() {
        warn!("could not quarantine {}", path.display());
    }
}
