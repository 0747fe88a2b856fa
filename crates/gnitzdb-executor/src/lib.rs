//! The reactive executor: the system catalog, the compiled-program
//! cache, the dependency-graph cascade, and the shared-memory IPC
//! server loop that ties them to client connections [spec §4.13-§4.17,
//! §6-§7].
//!
//! Grounded on `gnitz/server/` and `gnitz/catalog/` from the original
//! implementation; wire format and socket plumbing follow
//! `gnitz/server/ipc.py`/`ipc_ffi.py`, catalog bootstrap and the
//! dependency cascade follow `gnitz/catalog/system_tables.py`,
//! `gnitz/catalog/program_cache.py`, and `gnitz/server/executor.py`.

pub mod cascade;
pub mod catalog;
pub mod error;
pub mod ipc;
pub mod program_cache;
pub mod server;

pub use cascade::{CascadeExecutor, CascadeOutput, MAX_CASCADE_DEPTH};
pub use catalog::SystemCatalog;
pub use error::{ExecutorError, Result};
pub use program_cache::{ExecutablePlan, ProgramCache};
pub use server::{ServerConfig, ServerExecutor};
