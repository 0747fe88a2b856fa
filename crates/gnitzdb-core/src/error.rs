//! Error types for the core data-model layer (L0-L2).
//!
//! These are the variants of [spec §7] that can originate below the
//! storage engine: schema/identifier misuse and arena exhaustion.

use thiserror::Error;

/// Result type alias for `gnitzdb-core` operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or validating schemas, rows, and batches.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Schema or identifier misuse: duplicate column, unknown type code,
    /// invalid identifier, more than 64 columns, etc.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    /// A non-growable arena ran out of space.
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted {
        /// Bytes requested by the failed allocation.
        requested: usize,
        /// Bytes remaining in the arena.
        available: usize,
    },
}

/// Schema/identifier misuse, surfaced to the user [spec §7].
#[derive(Debug, Error)]
pub enum LayoutError {
    /// More than the maximum of 64 columns in a schema.
    #[error("schema has {0} columns, maximum is 64")]
    TooManyColumns(usize),

    /// The primary-key index is out of range for the column list.
    #[error("primary key index {0} is out of range for {1} columns")]
    InvalidPkIndex(usize, usize),

    /// A type code does not correspond to any known `FieldType`.
    #[error("unknown type code {0}")]
    UnknownTypeCode(u8),

    /// An identifier (table, column, view name) failed validation.
    #[error("invalid identifier {0:?}: {1}")]
    InvalidIdentifier(String, &'static str),

    /// A duplicate column name was supplied to a schema.
    #[error("duplicate column name {0:?}")]
    DuplicateColumn(String),
}
