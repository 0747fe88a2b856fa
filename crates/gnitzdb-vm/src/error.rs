//! VM error taxonomy [spec §7]: operator kernels never catch an error,
//! they propagate it straight to the interpreter, which halts the
//! program and records the message rather than panicking or triggering
//! a cascade to downstream views.

use thiserror::Error;

/// Result type alias for `gnitzdb-vm` operations.
pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("register {0} is not bound")]
    UnboundRegister(u16),

    #[error("register {0} index out of range for a register file of size {1}")]
    RegisterOutOfRange(u16, usize),

    #[error("register {0} expected a delta register")]
    NotADelta(u16),

    #[error("register {0} expected a trace register")]
    NotATrace(u16),

    #[error("instruction references an unset register operand")]
    MissingOperand,

    #[error("function {0} is not registered")]
    UnknownFunction(u32),

    #[error("instruction references an unset function id")]
    MissingFunction,

    #[error("jump target {0} out of bounds for a program of length {1}")]
    BadJump(usize, usize),

    #[error("storage error: {0}")]
    Storage(#[from] gnitzdb_storage::StorageError),

    #[error("core error: {0}")]
    Core(#[from] gnitzdb_core::CoreError),
}
