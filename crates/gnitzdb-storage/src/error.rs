//! Storage-layer error taxonomy [spec §7].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A shard region's checksum or magic did not match [spec §4.5, §7].
    #[error("corrupt shard region {region} in {path:?}")]
    CorruptShard { path: PathBuf, region: &'static str },

    /// A WAL block failed checksum or truncated mid-body [spec §4.4, §7].
    #[error("corrupt WAL segment {path:?}: {reason}")]
    CorruptWalSegment { path: PathBuf, reason: String },

    /// A manifest file failed checksum or magic validation [spec §4.6, §7].
    #[error("corrupt manifest {path:?}: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    /// Attempted out-of-range access in a mapped region. Always a bug.
    #[error("bounds error: offset {offset}, length {length}, limit {limit}")]
    BoundsError {
        offset: usize,
        length: usize,
        limit: usize,
    },

    /// A table's MemTable arena is full.
    #[error("memtable full: capacity {capacity} bytes exhausted")]
    MemTableFull { capacity: usize },

    /// A foreign-key check failed pre-commit; the whole batch is rejected.
    #[error("referential integrity violation: column {col_idx} references missing row in table {fk_table_id}")]
    ReferentialIntegrityViolation { col_idx: usize, fk_table_id: u64 },

    /// Schema/identifier misuse bubbled up from `gnitzdb-core`.
    #[error(transparent)]
    Layout(#[from] gnitzdb_core::LayoutError),

    #[error(transparent)]
    Core(#[from] gnitzdb_core::CoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
