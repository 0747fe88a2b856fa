//! The system catalog: schemas for the nine `_system` Z-sets plus a
//! registry mapping table/view ids to the relation that backs them
//! [spec §6 "System Z-sets"].
//!
//! DDL is just Z-set ingestion against these tables and client
//! disconnect is an algebraic retraction into `_subscriptions` — the
//! catalog itself is only schema definitions plus the id → relation
//! map the rest of the executor consults to resolve `table_id`s handed
//! out by instruction rows.
//!
//! Grounded on `gnitz/catalog/system_tables.py`'s hardcoded schema/
//! table id constants and schema factories; table storage itself is
//! opened the way `PersistentTable::open` is used elsewhere in this
//! workspace.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gnitzdb_core::{Column, FieldType, TableSchema};
use gnitzdb_storage::{PersistentTable, StorageConfigBuilder};
use gnitzdb_vm::TraceHandle;

use crate::error::{ExecutorError, Result};

pub const SYSTEM_SCHEMA_ID: u64 = 1;
pub const PUBLIC_SCHEMA_ID: u64 = 2;
pub const FIRST_USER_SCHEMA_ID: u64 = 3;

pub const SYS_TABLE_SCHEMAS: u64 = 1;
pub const SYS_TABLE_TABLES: u64 = 2;
pub const SYS_TABLE_VIEWS: u64 = 3;
pub const SYS_TABLE_COLUMNS: u64 = 4;
pub const SYS_TABLE_INDICES: u64 = 5;
pub const SYS_TABLE_VIEW_DEPS: u64 = 6;
pub const SYS_TABLE_SEQUENCES: u64 = 7;
pub const SYS_TABLE_INSTRUCTIONS: u64 = 8;
pub const SYS_TABLE_SUBSCRIPTIONS: u64 = 9;
pub const FIRST_USER_TABLE_ID: u64 = 10;

pub const OWNER_KIND_TABLE: u64 = 0;
pub const OWNER_KIND_VIEW: u64 = 1;

/// Packs `(owner_id, col_idx)` into `_columns`' PK, per spec §6.
pub fn pack_column_id(owner_id: u64, col_idx: usize) -> u64 {
    (owner_id << 9) | (col_idx as u64)
}

/// Packs `(view_id, seq)` into `_instructions`' 128-bit PK: `view_id`
/// in the high 64 bits so a seek on `(view_id, 0)` lands on the first
/// instruction of that program, and a forward scan naturally stays
/// within the program until `view_id` changes (`UnifiedCursor` orders
/// entries by `(hi, lo)`).
pub fn instruction_pk(view_id: u64, seq: u64) -> (u64, u64) {
    (seq, view_id)
}

fn schemas_schema() -> Arc<TableSchema> {
    TableSchema::new(vec![Column::new("schema_id", FieldType::U64), Column::new("name", FieldType::String)], 0)
        .expect("builtin schema")
}

fn tables_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("table_id", FieldType::U64),
            Column::new("schema_id", FieldType::U64),
            Column::new("name", FieldType::String),
            Column::new("directory", FieldType::String),
            Column::new("pk_col_idx", FieldType::U64),
            Column::new("created_lsn", FieldType::U64),
        ],
        0,
    )
    .expect("builtin schema")
}

fn views_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("view_id", FieldType::U64),
            Column::new("schema_id", FieldType::U64),
            Column::new("name", FieldType::String),
            Column::new("sql_definition", FieldType::String),
            Column::new("cache_directory", FieldType::String),
            Column::new("created_lsn", FieldType::U64),
        ],
        0,
    )
    .expect("builtin schema")
}

fn columns_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("column_id", FieldType::U64),
            Column::new("owner_id", FieldType::U64),
            Column::new("owner_kind", FieldType::U64),
            Column::new("col_idx", FieldType::U64),
            Column::new("name", FieldType::String),
            Column::new("type_code", FieldType::U64),
            Column::new("is_nullable", FieldType::U64),
            Column::new("fk_table_id", FieldType::U64),
            Column::new("fk_col_idx", FieldType::U64),
        ],
        0,
    )
    .expect("builtin schema")
}

fn indices_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("index_id", FieldType::U64),
            Column::new("owner_id", FieldType::U64),
            Column::new("owner_kind", FieldType::U64),
            Column::new("source_col_idx", FieldType::U64),
            Column::new("name", FieldType::String),
            Column::new("is_unique", FieldType::U64),
            Column::new("cache_directory", FieldType::String),
        ],
        0,
    )
    .expect("builtin schema")
}

fn view_deps_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("dep_id", FieldType::U64),
            Column::new("view_id", FieldType::U64),
            Column::new("dep_view_id", FieldType::U64),
            Column::new("dep_table_id", FieldType::U64),
        ],
        0,
    )
    .expect("builtin schema")
}

fn sequences_schema() -> Arc<TableSchema> {
    TableSchema::new(vec![Column::new("seq_id", FieldType::U64), Column::new("next_val", FieldType::U64)], 0)
        .expect("builtin schema")
}

/// `_instructions` rows carry the full `Instruction` shape flattened
/// into columns: one row per (view_id, seq) program slot [spec §4.11,
/// §6]. `group_by_cols` is stored as a comma-joined string since
/// `TableSchema` has no list-valued column type.
fn instructions_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            // PK: (view_id << 64) | seq, packed as u128 via instruction_pk().
            Column::new("instr_id", FieldType::U128),
            Column::new("view_id", FieldType::U64),
            Column::new("seq", FieldType::U64),
            Column::new("opcode", FieldType::U64),
            Column::new("reg_a", FieldType::U64).nullable(),
            Column::new("reg_b", FieldType::U64).nullable(),
            Column::new("reg_c", FieldType::U64).nullable(),
            Column::new("reg_out", FieldType::U64).nullable(),
            Column::new("func_id", FieldType::U64).nullable(),
            Column::new("group_by_cols", FieldType::String).nullable(),
            Column::new("chunk_limit", FieldType::U64).nullable(),
            Column::new("jump_target", FieldType::U64).nullable(),
            Column::new("yield_reason", FieldType::U64).nullable(),
            Column::new("target_table_id", FieldType::U64).nullable(),
        ],
        0,
    )
    .expect("builtin schema")
}

fn subscriptions_schema() -> Arc<TableSchema> {
    TableSchema::new(
        vec![
            Column::new("sub_id", FieldType::U64),
            Column::new("view_id", FieldType::U64),
            Column::new("client_id", FieldType::U64),
        ],
        0,
    )
    .expect("builtin schema")
}

/// The nine system tables plus a registry mapping every table/view id
/// seen so far (system or user) to the [`TraceHandle`] backing it.
///
/// `gnitzdb-vm`'s `TraceHandle` already abstracts over persistent vs.
/// ephemeral relations, so the catalog reuses it rather than inventing
/// a parallel "family" wrapper.
pub struct SystemCatalog {
    base_dir: PathBuf,
    relations: DashMap<u64, TraceHandle>,
    next_table_id: AtomicU64,
    next_schema_id: AtomicU64,
}

impl SystemCatalog {
    /// Open (or create) the nine system tables under `base_dir` and
    /// register them by their hardcoded ids.
    pub fn bootstrap(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let catalog = SystemCatalog {
            base_dir: base_dir.clone(),
            relations: DashMap::new(),
            next_table_id: AtomicU64::new(FIRST_USER_TABLE_ID),
            next_schema_id: AtomicU64::new(FIRST_USER_SCHEMA_ID),
        };

        let system_tables: [(u64, &str, Arc<TableSchema>); 9] = [
            (SYS_TABLE_SCHEMAS, "_schemas", schemas_schema()),
            (SYS_TABLE_TABLES, "_tables", tables_schema()),
            (SYS_TABLE_VIEWS, "_views", views_schema()),
            (SYS_TABLE_COLUMNS, "_columns", columns_schema()),
            (SYS_TABLE_INDICES, "_indices", indices_schema()),
            (SYS_TABLE_VIEW_DEPS, "_view_deps", view_deps_schema()),
            (SYS_TABLE_SEQUENCES, "_sequences", sequences_schema()),
            (SYS_TABLE_INSTRUCTIONS, "_instructions", instructions_schema()),
            (SYS_TABLE_SUBSCRIPTIONS, "_subscriptions", subscriptions_schema()),
        ];

        for (table_id, dirname, schema) in system_tables {
            let table = catalog.open_table(dirname, schema, table_id)?;
            catalog.relations.insert(table_id, TraceHandle::Persistent(Arc::new(table)));
        }

        Ok(catalog)
    }

    fn open_table(&self, dirname: &str, schema: Arc<TableSchema>, table_id: u64) -> Result<PersistentTable> {
        let dir = self.table_dir(dirname);
        let config = StorageConfigBuilder::new().base_dir(dir).build();
        Ok(PersistentTable::open(&config, schema, table_id)?)
    }

    fn table_dir(&self, dirname: &str) -> PathBuf {
        self.base_dir.join("_system_catalog").join(dirname)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn has_id(&self, id: u64) -> bool {
        self.relations.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<TraceHandle> {
        self.relations.get(&id).map(|r| r.clone())
    }

    pub fn get_or_err(&self, id: u64) -> Result<TraceHandle> {
        self.get(id).ok_or(ExecutorError::UnknownSystemTable(id))
    }

    /// Register a user table or view-output relation under its id,
    /// as assigned by the corresponding `_tables`/`_views` row.
    pub fn register(&self, id: u64, handle: TraceHandle) {
        self.relations.insert(id, handle);
    }

    pub fn alloc_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn alloc_schema_id(&self) -> u64 {
        self.next_schema_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_registers_all_nine_system_tables() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SystemCatalog::bootstrap(dir.path()).unwrap();
        for id in [
            SYS_TABLE_SCHEMAS,
            SYS_TABLE_TABLES,
            SYS_TABLE_VIEWS,
            SYS_TABLE_COLUMNS,
            SYS_TABLE_INDICES,
            SYS_TABLE_VIEW_DEPS,
            SYS_TABLE_SEQUENCES,
            SYS_TABLE_INSTRUCTIONS,
            SYS_TABLE_SUBSCRIPTIONS,
        ] {
            assert!(catalog.has_id(id), "missing system table {id}");
        }
        assert!(!catalog.has_id(FIRST_USER_TABLE_ID));
    }

    #[test]
    fn pack_column_id_matches_shift() {
        assert_eq!(pack_column_id(3, 5), (3 << 9) | 5);
    }
}
