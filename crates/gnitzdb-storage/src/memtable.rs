//! In-memory mutable buffer ahead of the WAL-durable shard boundary
//! [spec §3 "MemTable", §4.3].
//!
//! Grounded on the teacher's `UnifiedStore` (`unified.rs`): an ordered
//! map behind a single `parking_lot::RwLock`, giving snapshot-stable
//! readers and a single writer. Keyed by `(pk_hi, pk_lo)` — the same
//! unsigned tuple order shards and `ZSetBatch` use — with a small `Vec`
//! per key so distinct payloads sharing one primary key (a legal Z-set
//! state; only net-zero-weight *identical* rows annihilate) coexist
//! without needing an `Ord` impl on `PayloadRow` itself.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema, ZSetBatch};
use parking_lot::RwLock;

use crate::error::Result;
use crate::shard::writer::TableShardWriter;

type Bucket = Vec<(i64, Arc<PayloadRow>)>;

/// A single table's mutable, in-memory Z-set buffer.
pub struct MemTable {
    schema: Arc<TableSchema>,
    entries: RwLock<BTreeMap<(u64, u64), Bucket>>,
}

impl MemTable {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        MemTable {
            schema,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Merge every entry of `batch` into the table, summing weights for
    /// matching `(pk, payload)` pairs and dropping any pair whose net
    /// weight reaches zero — the Ghost Property, applied incrementally
    /// instead of via a batch `consolidate()` pass [spec §4.3, §8].
    pub fn upsert_batch(&self, batch: &ZSetBatch) {
        let mut entries = self.entries.write();
        for (pk, weight, row) in batch.iter() {
            let key = (pk.1, pk.0);
            let bucket = entries.entry(key).or_default();
            match bucket.iter_mut().find(|(_, r)| r.as_ref() == row.as_ref()) {
                Some((w, _)) => {
                    *w += weight;
                    if *w == 0 {
                        bucket.retain(|(w, _)| *w != 0);
                    }
                }
                None => {
                    if weight != 0 {
                        bucket.push((weight, row.clone()));
                    }
                }
            }
            if bucket.is_empty() {
                entries.remove(&key);
            }
        }
    }

    /// Current net weight of the exact `(pk, payload)` pair, or `0` if
    /// absent [spec §4.3 "find_exact"].
    pub fn find_exact(&self, pk: (u64, u64), row: &PayloadRow) -> i64 {
        let entries = self.entries.read();
        entries
            .get(&(pk.1, pk.0))
            .and_then(|bucket| bucket.iter().find(|(_, r)| r.as_ref() == row))
            .map_or(0, |(w, _)| *w)
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot every live `(pk, weight, row)` entry, ascending by PK
    /// then payload order — the order a shard or cursor expects.
    pub fn snapshot(&self) -> Vec<((u64, u64), i64, Arc<PayloadRow>)> {
        let entries = self.entries.read();
        let mut out = Vec::with_capacity(entries.values().map(Vec::len).sum());
        for (&(hi, lo), bucket) in entries.iter() {
            let mut bucket = bucket.clone();
            bucket.sort_by(|a, b| a.1.cmp_payload(&b.1));
            for (w, row) in bucket {
                out.push(((lo, hi), w, row));
            }
        }
        out
    }

    /// Write every live entry out as a new immutable shard
    /// [spec §4.3 "flush_to_shard"].
    pub fn flush_to_shard(&self, path: impl AsRef<Path>, table_id: u64) -> Result<()> {
        let mut writer = TableShardWriter::new(self.schema.clone(), table_id);
        for (pk, weight, row) in self.snapshot() {
            writer.add_row(pk.0, pk.1, weight, row);
        }
        writer.finalize(path)
    }

    /// Drop all entries, freeing the table's memory after a successful
    /// flush [spec §4.3 "free"].
    pub fn free(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::{Column, FieldType, PayloadRowBuilder};
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("name", FieldType::String),
            ],
            0,
        )
        .unwrap()
    }

    fn row(schema: &Arc<TableSchema>, name: &str) -> Arc<PayloadRow> {
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string(name);
        Arc::new(b.finish())
    }

    #[test]
    fn upsert_then_find_exact() {
        let schema = schema();
        let mt = MemTable::new(schema.clone());
        let mut batch = ZSetBatch::new(schema.clone());
        let r = row(&schema, "alice");
        batch.append(1, 0, 1, r.clone());
        mt.upsert_batch(&batch);
        assert_eq!(mt.find_exact((1, 0), &r), 1);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn opposite_weights_annihilate() {
        let schema = schema();
        let mt = MemTable::new(schema.clone());
        let r = row(&schema, "alice");

        let mut up = ZSetBatch::new(schema.clone());
        up.append(1, 0, 1, r.clone());
        mt.upsert_batch(&up);

        let mut down = ZSetBatch::new(schema.clone());
        down.append(1, 0, -1, r.clone());
        mt.upsert_batch(&down);

        assert_eq!(mt.find_exact((1, 0), &r), 0);
        assert!(mt.is_empty());
    }

    #[test]
    fn distinct_payloads_sharing_a_pk_coexist() {
        let schema = schema();
        let mt = MemTable::new(schema.clone());
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, 1, row(&schema, "alice"));
        batch.append(1, 0, 1, row(&schema, "alicia"));
        mt.upsert_batch(&batch);
        assert_eq!(mt.len(), 2);
    }

    #[test]
    fn flush_writes_all_live_rows() {
        let schema = schema();
        let mt = MemTable::new(schema.clone());
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(2, 0, 1, row(&schema, "bob"));
        batch.append(1, 0, 1, row(&schema, "alice"));
        mt.upsert_batch(&batch);

        let dir = tempdir().unwrap();
        let path = dir.path().join("flushed.gdb");
        mt.flush_to_shard(&path, 1).unwrap();
        assert!(path.exists());

        mt.free();
        assert!(mt.is_empty());
    }
}
