//! Arena, schema, payload row and Z-set primitives (L0-L2).
//!
//! This crate has no notion of durability, shards, or the VM — it is
//! the in-memory data model that `gnitzdb-storage` and `gnitzdb-vm`
//! build on.

pub mod arena;
pub mod error;
pub mod row;
pub mod schema;
pub mod strings;
pub mod types;
pub mod zset;

pub use arena::{Arena, ArenaOffset, ArenaView};
pub use error::{CoreError, LayoutError, Result};
pub use row::{PayloadRow, PayloadRowBuilder};
pub use schema::{validate_identifier, Column, PayloadSlot, TableSchema, MAX_COLUMNS};
pub use strings::{GermanString, SHORT_STRING_THRESHOLD};
pub use types::{align_up, FieldType};
pub use zset::ZSetBatch;
