//! `EphemeralTable`: a MemTable plus temporary, unlogged shards —
//! no WAL, no durability, used for VM operator traces and other
//! working state that is rebuilt from its upstream inputs rather than
//! recovered from disk [spec §2 layering table "L3 EphemeralTable"].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema, ZSetBatch};

use crate::cursor::UnifiedCursor;
use crate::error::Result;
use crate::memtable::MemTable;
use crate::refcount::RefCounter;
use crate::shard::reader::ShardView;

/// A table with no WAL and no manifest: shard files exist only to
/// spill a trace too large to keep resident, and are discarded with
/// the table.
pub struct EphemeralTable {
    schema: Arc<TableSchema>,
    table_id: u64,
    dir: PathBuf,
    memtable: MemTable,
    refcounter: Arc<RefCounter>,
    spilled: parking_lot::RwLock<Vec<PathBuf>>,
    shard_counter: AtomicU64,
}

impl EphemeralTable {
    pub fn new(schema: Arc<TableSchema>, table_id: u64, spill_dir: impl Into<PathBuf>) -> Self {
        EphemeralTable {
            memtable: MemTable::new(schema.clone()),
            schema,
            table_id,
            dir: spill_dir.into(),
            refcounter: Arc::new(RefCounter::new()),
            spilled: parking_lot::RwLock::new(Vec::new()),
            shard_counter: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Merge a delta directly into the MemTable, no WAL involved
    /// [spec §4.10 "upsert_batch (no WAL)"].
    pub fn upsert_batch(&self, batch: &ZSetBatch) {
        self.memtable.upsert_batch(batch);
    }

    pub fn find_exact(&self, pk: (u64, u64), row: &PayloadRow) -> i64 {
        self.memtable.find_exact(pk, row)
    }

    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    /// Spill the current MemTable contents to a temp shard under the
    /// table's spill directory and free the MemTable, keeping the
    /// spilled shard part of this table's logical contents.
    pub fn spill(&self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let idx = self.shard_counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("spill-{idx:010}.gdb"));
        self.memtable.flush_to_shard(&path, self.table_id)?;
        self.memtable.free();
        self.spilled.write().push(path);
        Ok(())
    }

    pub fn create_cursor(&self) -> Result<UnifiedCursor> {
        let spilled = self.spilled.read();
        let mut shards = Vec::with_capacity(spilled.len());
        for path in spilled.iter() {
            let view = Arc::new(ShardView::open(path, self.schema.clone())?);
            shards.push((view, path.clone()));
        }
        UnifiedCursor::open(Some(&self.memtable), shards, self.refcounter.clone())
    }

    /// Discard every spilled shard file; the table itself is dropped
    /// with its owner (no manifest, nothing else references these
    /// files) [spec §4.10 "drop"].
    pub fn discard(&self) -> Result<()> {
        for path in self.spilled.write().drain(..) {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::{Column, FieldType, PayloadRowBuilder};
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(vec![Column::new("id", FieldType::U64), Column::new("v", FieldType::I64)], 0).unwrap()
    }

    #[test]
    fn upsert_spill_and_read_back() {
        let schema = schema();
        let dir = tempdir().unwrap();
        let table = EphemeralTable::new(schema.clone(), 1, dir.path());

        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_int(42);
        let row = Arc::new(b.finish());
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, 1, row.clone());
        table.upsert_batch(&batch);
        table.spill().unwrap();
        assert!(table.is_empty());

        let mut cursor = table.create_cursor().unwrap();
        assert!(cursor.is_valid());
        assert_eq!(cursor.get_accessor().unwrap().get_int_signed(1), 42);

        table.discard().unwrap();
    }
}
