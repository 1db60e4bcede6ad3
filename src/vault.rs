//! Backup vault
//!
//! Byte-exact snapshots of files taken lazily before their first mutation in
//! a session. Restores on rollback; releases everything on commit. No file
//! may be written except through `write_through`, which enforces the
//! backup-before-mutation invariant.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BACKUP_DIR: &str = "rollback_backups";
const INDEX_FILE: &str = "index.json";

/// Maps backup file names back to the original paths they shadow.
#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultIndex {
    entries: HashMap<String, PathBuf>,
}

/// Per-session snapshot store.
pub struct BackupVault {
    session_dir: PathBuf,
    /// Original path -> backup path, for files currently held.
    slots: HashMap<PathBuf, PathBuf>,
    /// Acquisition order; abort restores in reverse.
    held: Vec<PathBuf>,
    index: VaultIndex,
}

impl BackupVault {
    pub fn open(data_dir: &Path, session_id: &str) -> Result<Self> {
        let session_dir = data_dir.join(BACKUP_DIR).join(session_id);
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        Ok(Self {
            session_dir,
            slots: HashMap::new(),
            held: Vec::new(),
            index: VaultIndex::default(),
        })
    }

    /// Snapshot a file before its first mutation. Idempotent within the
    /// session: a second call for the same path keeps the first snapshot.
    pub fn ensure_backup(&mut self, path: &Path) -> Result<()> {
        if self.slots.contains_key(path) {
            return Ok(());
        }
        let name = mangle(path);
        let backup_path = self.session_dir.join(&name);
        fs::copy(path, &backup_path).with_context(|| {
            format!(
                "failed to back up {} -> {}",
                path.display(),
                backup_path.display()
            )
        })?;
        self.slots.insert(path.to_path_buf(), backup_path);
        self.held.push(path.to_path_buf());
        self.index.entries.insert(name, path.to_path_buf());
        self.save_index()?;
        Ok(())
    }

    /// Write new content to a file, refusing if no snapshot is held for it.
    /// This is the sole mutation path during a session.
    pub fn write_through(&mut self, path: &Path, content: &str) -> Result<()> {
        if !self.slots.contains_key(path) {
            bail!(
                "invariant violation: write to {} without a backup snapshot",
                path.display()
            );
        }
        fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn has_backup(&self, path: &Path) -> bool {
        self.slots.contains_key(path)
    }

    /// Copy the stored bytes back and release the slot.
    pub fn restore(&mut self, path: &Path) -> Result<()> {
        let Some(backup_path) = self.slots.remove(path) else {
            // Nothing held for this path; nothing to undo.
            return Ok(());
        };
        fs::copy(&backup_path, path).with_context(|| {
            format!(
                "failed to restore {} from {}",
                path.display(),
                backup_path.display()
            )
        })?;
        self.held.retain(|p| p != path);
        info!("restored {} from backup", path.display());
        Ok(())
    }

    /// Restore every held snapshot, most recently acquired first.
    pub fn abort(&mut self) -> Result<()> {
        let order: Vec<PathBuf> = self.held.iter().rev().cloned().collect();
        for path in order {
            self.restore(&path)?;
        }
        self.cleanup();
        Ok(())
    }

    /// Release all snapshots; mutations become permanent.
    pub fn commit(&mut self) {
        self.slots.clear();
        self.held.clear();
        self.cleanup();
    }

    /// Paths currently protected by a snapshot, in acquisition order.
    pub fn held_paths(&self) -> &[PathBuf] {
        &self.held
    }

    fn cleanup(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.session_dir) {
            warn!(
                "could not remove backup dir {}: {}",
                self.session_dir.display(),
                e
            );
        }
    }

    fn save_index(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.index)?;
        fs::write(self.session_dir.join(INDEX_FILE), content)?;
        Ok(())
    }
}

/// Restore all files recorded by leftover (uncommitted) sessions, newest
/// directory first. Used by the `rollback` CLI command.
pub fn restore_leftover_sessions(data_dir: &Path) -> Result<usize> {
    let root = data_dir.join(BACKUP_DIR);
    if !root.is_dir() {
        return Ok(0);
    }
    let mut restored = 0;
    let mut sessions: Vec<PathBuf> = fs::read_dir(&root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    sessions.sort();
    for session in sessions.iter().rev() {
        let index_path = session.join(INDEX_FILE);
        let Ok(content) = fs::read_to_string(&index_path) else {
            continue;
        };
        let Ok(index) = serde_json::from_str::<VaultIndex>(&content) else {
            warn!("unreadable vault index in {}", session.display());
            continue;
        };
        for (name, original) in &index.entries {
            let backup = session.join(name);
            if backup.exists() && fs::copy(&backup, original).is_ok() {
                info!("restored {}", original.display());
                restored += 1;
            }
        }
        let _ = fs::remove_dir_all(session);
    }
    Ok(restored)
}

/// Flatten a path into a single backup file name.
fn mangle(path: &Path) -> String {
    let flat: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}.bak", flat.trim_start_matches('_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, BackupVault) {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("code.py");
        fs::write(&file, "original\n").unwrap();
        let vault = BackupVault::open(&tmp.path().join(".mend"), "s1").unwrap();
        (tmp, file, vault)
    }

    #[test]
    fn test_write_without_backup_is_refused() {
        let (_tmp, file, mut vault) = setup();
        let err = vault.write_through(&file, "mutated\n").unwrap_err();
        assert!(err.to_string().contains("invariant violation"));
        assert_eq!(fs::read_to_string(&file).unwrap(), "original\n");
    }

    #[test]
    fn test_backup_then_restore_is_byte_exact() {
        let (_tmp, file, mut vault) = setup();
        vault.ensure_backup(&file).unwrap();
        vault.write_through(&file, "mutated\n").unwrap();
        vault.restore(&file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "original\n");
        assert!(!vault.has_backup(&file));
    }

    #[test]
    fn test_ensure_backup_is_idempotent() {
        let (_tmp, file, mut vault) = setup();
        vault.ensure_backup(&file).unwrap();
        vault.write_through(&file, "mutated once\n").unwrap();
        // A second ensure must keep the first snapshot's bytes.
        vault.ensure_backup(&file).unwrap();
        vault.restore(&file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "original\n");
    }

    #[test]
    fn test_abort_restores_in_reverse_order() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.py");
        let b = tmp.path().join("b.py");
        fs::write(&a, "a0").unwrap();
        fs::write(&b, "b0").unwrap();
        let mut vault = BackupVault::open(&tmp.path().join(".mend"), "s1").unwrap();
        vault.ensure_backup(&a).unwrap();
        vault.ensure_backup(&b).unwrap();
        vault.write_through(&a, "a1").unwrap();
        vault.write_through(&b, "b1").unwrap();
        vault.abort().unwrap();
        assert_eq!(fs::read_to_string(&a).unwrap(), "a0");
        assert_eq!(fs::read_to_string(&b).unwrap(), "b0");
        assert!(vault.held_paths().is_empty());
    }

    #[test]
    fn test_commit_keeps_mutations_and_clears_backups() {
        let (tmp, file, mut vault) = setup();
        vault.ensure_backup(&file).unwrap();
        vault.write_through(&file, "fixed\n").unwrap();
        vault.commit();
        assert_eq!(fs::read_to_string(&file).unwrap(), "fixed\n");
        assert!(!tmp.path().join(".mend/rollback_backups/s1").exists());
    }

    #[test]
    fn test_restore_leftover_sessions() {
        let (tmp, file, mut vault) = setup();
        vault.ensure_backup(&file).unwrap();
        vault.write_through(&file, "broken\n").unwrap();
        // Simulate a crash: vault dropped without commit or abort.
        drop(vault);
        let restored = restore_leftover_sessions(&tmp.path().join(".mend")).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), "original\n");
    }
}
