//! Storage-layer configuration [spec §0.3 ambient config].
//!
//! Grounded on the teacher's `database::DatabaseConfig`/`wal::WalConfig`
//! builder pattern: a plain `Default`-able struct plus a `Builder` that
//! validates and assembles it.

use std::path::PathBuf;

use crate::wal::DurabilityMode;

/// Configuration for one `PersistentTable` (or the database-wide
/// defaults new tables inherit).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding this table's WAL segments, shards, and manifest.
    pub base_dir: PathBuf,
    /// MemTable arena capacity in bytes before a flush is triggered.
    pub memtable_capacity_bytes: usize,
    /// WAL durability policy.
    pub durability: DurabilityMode,
    /// Target size of a freshly written shard, in bytes. Advisory —
    /// `flush_to_shard` always writes the whole MemTable in one shard.
    pub shard_target_bytes: usize,
    /// Maximum bytes per WAL segment file before rolling.
    pub wal_segment_bytes: u64,
    /// Compaction trigger: minimum overlapping shard count on some PK
    /// range before a compaction is scheduled [spec §4.8].
    pub compaction_overlap_threshold: usize,
    /// Compaction trigger: read-amplification ratio (live bytes /
    /// useful bytes) above which compaction is scheduled.
    pub compaction_read_amp_threshold: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            base_dir: PathBuf::from("./gnitzdb-data"),
            memtable_capacity_bytes: 64 * 1024 * 1024,
            durability: DurabilityMode::default(),
            shard_target_bytes: 64 * 1024 * 1024,
            wal_segment_bytes: 16 * 1024 * 1024,
            compaction_overlap_threshold: 4,
            compaction_read_amp_threshold: 2.0,
        }
    }
}

/// Builds a [`StorageConfig`], matching the teacher's
/// `DatabaseConfig`/`WalConfig` builder idiom.
#[derive(Debug, Default)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    pub fn new() -> Self {
        StorageConfigBuilder {
            config: StorageConfig::default(),
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = dir.into();
        self
    }

    pub fn memtable_capacity_bytes(mut self, bytes: usize) -> Self {
        self.config.memtable_capacity_bytes = bytes;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.config.durability = mode;
        self
    }

    pub fn shard_target_bytes(mut self, bytes: usize) -> Self {
        self.config.shard_target_bytes = bytes;
        self
    }

    pub fn wal_segment_bytes(mut self, bytes: u64) -> Self {
        self.config.wal_segment_bytes = bytes;
        self
    }

    pub fn compaction_overlap_threshold(mut self, n: usize) -> Self {
        self.config.compaction_overlap_threshold = n;
        self
    }

    pub fn compaction_read_amp_threshold(mut self, ratio: f64) -> Self {
        self.config.compaction_read_amp_threshold = ratio;
        self
    }

    pub fn build(self) -> StorageConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = StorageConfigBuilder::new()
            .base_dir("/tmp/gnitzdb")
            .memtable_capacity_bytes(1024)
            .durability(DurabilityMode::Strict)
            .build();
        assert_eq!(cfg.base_dir, PathBuf::from("/tmp/gnitzdb"));
        assert_eq!(cfg.memtable_capacity_bytes, 1024);
        assert_eq!(cfg.durability, DurabilityMode::Strict);
    }
}
