//! Executor-level errors: catalog bootstrap failures, program-cache
//! misses, and IPC transport faults [spec §7].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("system table {0} is not present in the catalog")]
    UnknownSystemTable(u64),

    #[error("ipc header magic mismatch: expected {expected:#x}, got {got:#x}")]
    BadMagic { expected: u64, got: u64 },

    #[error("ipc payload truncated: header declares {declared} bytes, segment is {actual}")]
    TruncatedPayload { declared: u64, actual: u64 },

    #[error("ipc transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Storage(#[from] gnitzdb_storage::StorageError),

    #[error(transparent)]
    Core(#[from] gnitzdb_core::CoreError),

    #[error(transparent)]
    Vm(#[from] gnitzdb_vm::VmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
impl From<nix::Error> for ExecutorError {
    fn from(e: nix::Error) -> Self {
        ExecutorError::Transport(e.to_string())
    }
}
