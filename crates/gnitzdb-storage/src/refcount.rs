//! Shard reference counting and deferred deletion
//! [spec §3 "Shard lifecycle", §4.7].
//!
//! A shard file stays on disk as long as either a manifest still lists
//! it or a cursor still has it pinned. Compaction marks its inputs for
//! deletion once the output shard is published; the actual `unlink`
//! only happens once the refcount drops to zero, so an in-flight
//! `UnifiedCursor` reading an old shard never sees the file vanish out
//! from under it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

#[derive(Default)]
struct Entry {
    refcount: u64,
    marked_for_delete: bool,
}

/// Tracks live references to shard files across cursors and compaction.
pub struct RefCounter {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl RefCounter {
    pub fn new() -> Self {
        RefCounter {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a shard path, bumping its refcount. Call once per cursor or
    /// other long-lived holder that opens the file.
    pub fn acquire(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.entry(path.to_path_buf()).or_default().refcount += 1;
    }

    /// Release a previously acquired pin. If the shard is marked for
    /// deletion and this was the last reference, unlinks it immediately.
    pub fn release(&self, path: &Path) -> Result<()> {
        let should_unlink = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(path) {
                entry.refcount = entry.refcount.saturating_sub(1);
                let drop_entry = entry.refcount == 0 && entry.marked_for_delete;
                if entry.refcount == 0 {
                    entries.remove(path);
                }
                drop_entry
            } else {
                false
            }
        };
        if should_unlink {
            unlink(path)?;
        }
        Ok(())
    }

    /// Mark a shard for deletion once all current references drain.
    /// Compaction calls this for every input shard it consumed, right
    /// after the output shard and new manifest are published.
    pub fn mark_for_deletion(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.entry(path.to_path_buf()).or_default().marked_for_delete = true;
    }

    /// Unlink every marked shard whose refcount has already reached
    /// zero. Called opportunistically after compaction and cursor
    /// close.
    pub fn try_cleanup(&self) -> Result<()> {
        let ready: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            let ready: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, e)| e.marked_for_delete && e.refcount == 0)
                .map(|(p, _)| p.clone())
                .collect();
            for p in &ready {
                entries.remove(p);
            }
            ready
        };
        for path in ready {
            unlink(&path)?;
        }
        Ok(())
    }

    pub fn refcount(&self, path: &Path) -> u64 {
        self.entries.lock().get(path).map_or(0, |e| e.refcount)
    }

    pub fn is_marked_for_deletion(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .get(path)
            .is_some_and(|e| e.marked_for_delete)
    }
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = ?path, error = %e, "failed to unlink marked shard");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marked_and_zero_refcount_is_unlinked_on_cleanup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.gdb");
        fs::write(&path, b"data").unwrap();

        let rc = RefCounter::new();
        rc.acquire(&path);
        rc.mark_for_deletion(&path);
        rc.try_cleanup().unwrap();
        assert!(path.exists(), "still referenced, must not be deleted yet");

        rc.release(&path).unwrap();
        assert!(!path.exists(), "last release should have unlinked it");
    }

    #[test]
    fn unmarked_shard_survives_zero_refcount() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.gdb");
        fs::write(&path, b"data").unwrap();

        let rc = RefCounter::new();
        rc.acquire(&path);
        rc.release(&path).unwrap();
        rc.try_cleanup().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn mark_for_deletion_then_release_last_ref_unlinks_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.gdb");
        fs::write(&path, b"data").unwrap();

        let rc = RefCounter::new();
        rc.acquire(&path);
        rc.mark_for_deletion(&path);
        rc.release(&path).unwrap();
        assert!(!path.exists());
    }
}
