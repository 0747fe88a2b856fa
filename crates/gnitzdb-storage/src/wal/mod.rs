//! Write-ahead log module [spec §3 "WAL Block", §4.4, §6 "WAL file format"].
//!
//! - **Segment-based storage**: the log is split into `wal-NNNNN.seg`
//!   files; only the active segment is writable.
//! - **Self-delimiting blocks**: each block carries its own length and
//!   checksum, so a reader never needs an external index to iterate.
//! - **Durability modes**: `InMemory`, `Strict`, `Batched`, `Async`.
//! - **Crash recovery**: the reader stops at the first undecodable
//!   block rather than erroring the whole replay.
//!
//! ```text
//! wal/
//! ├── wal-00000000000000000000.seg   (closed, immutable)
//! └── wal-00000000000000000005.seg   (active, writable)
//! ```

pub mod durability;
pub mod format;
pub mod reader;
pub mod writer;

pub use durability::DurabilityMode;
pub use format::{DecodedBlock, WalEntry, WAL_BLOCK_HEADER_SIZE};
pub use reader::WalReader;
pub use writer::WalWriter;
