//! Durability modes for a table's WAL [spec §0.3 ambient config].
//!
//! Ported unmodified from the teacher's `wal::durability` module: GnitzDB
//! is single-writer per table, so these modes apply per-table.

/// Controls when an appended WAL block is fsynced relative to
/// `append_block` returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No WAL at all; ingestions are only as durable as the MemTable
    /// and any already-flushed shards. Used by `EphemeralTable`.
    InMemory,
    /// fsync after every block. Slowest, strongest.
    Strict,
    /// fsync after `batch_size` blocks or `interval_ms`, whichever
    /// comes first.
    Batched { interval_ms: u64, batch_size: usize },
    /// fsync on a fixed timer, independent of block count.
    Async { interval_ms: u64 },
}

impl DurabilityMode {
    /// Whether this mode requires a WAL at all.
    pub fn requires_wal(self) -> bool {
        !matches!(self, DurabilityMode::InMemory)
    }

    /// Whether every `append_block` must fsync before returning.
    pub fn requires_immediate_fsync(self) -> bool {
        matches!(self, DurabilityMode::Strict)
    }

    pub fn description(self) -> &'static str {
        match self {
            DurabilityMode::InMemory => "in-memory, no WAL",
            DurabilityMode::Strict => "fsync every block",
            DurabilityMode::Batched { .. } => "fsync on batch size or interval",
            DurabilityMode::Async { .. } => "fsync on a timer",
        }
    }

    /// A reasonable default for a buffered table: fsync at most every
    /// 100ms or every 1000 blocks.
    pub fn buffered_default() -> Self {
        DurabilityMode::Batched {
            interval_ms: 100,
            batch_size: 1000,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::buffered_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_skips_wal() {
        assert!(!DurabilityMode::InMemory.requires_wal());
        assert!(DurabilityMode::Strict.requires_wal());
    }

    #[test]
    fn only_strict_forces_immediate_fsync() {
        assert!(DurabilityMode::Strict.requires_immediate_fsync());
        assert!(!DurabilityMode::buffered_default().requires_immediate_fsync());
        assert!(!DurabilityMode::Async { interval_ms: 50 }.requires_immediate_fsync());
    }

    #[test]
    fn default_is_buffered() {
        assert_eq!(
            DurabilityMode::default(),
            DurabilityMode::Batched {
                interval_ms: 100,
                batch_size: 1000
            }
        );
    }
}
