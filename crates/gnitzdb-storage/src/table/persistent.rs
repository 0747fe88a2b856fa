//! `PersistentTable`: fuses the WAL, MemTable, and manifest-indexed
//! shard set into the durable single-table storage engine
//! [spec §3 "PersistentTable", §4.9].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema, ZSetBatch};
use parking_lot::RwLock;
use tracing::info;

use crate::compaction::{should_compact, Compactor};
use crate::config::StorageConfig;
use crate::cursor::UnifiedCursor;
use crate::error::Result;
use crate::manifest::{Manifest, ManifestManager};
use crate::memtable::MemTable;
use crate::refcount::RefCounter;
use crate::shard::reader::ShardView;
use crate::wal::{DecodedBlock, WalEntry, WalReader, WalWriter};

fn wal_dir(base: &Path) -> PathBuf {
    base.join("wal")
}
fn shard_dir(base: &Path) -> PathBuf {
    base.join("shards")
}
fn manifest_path(base: &Path) -> PathBuf {
    base.join("CURRENT")
}

/// A table durable across restarts: every ingest goes through the WAL
/// before the MemTable, every flush writes a new immutable shard and
/// publishes a new manifest, and reads merge the MemTable with every
/// live shard [spec §4.9].
pub struct PersistentTable {
    schema: Arc<TableSchema>,
    table_id: u64,
    dir: PathBuf,
    wal_writer: parking_lot::Mutex<WalWriter>,
    memtable: MemTable,
    manifest_mgr: ManifestManager,
    refcounter: Arc<RefCounter>,
    next_lsn: AtomicU64,
    shard_counter: AtomicU64,
    memtable_capacity_bytes: usize,
    compaction_overlap_threshold: usize,
}

impl PersistentTable {
    /// Open (creating if absent) a table's on-disk state, replaying any
    /// WAL blocks not yet reflected in a flushed shard.
    pub fn open(config: &StorageConfig, schema: Arc<TableSchema>, table_id: u64) -> Result<Self> {
        let dir = config.base_dir.join(format!("table-{table_id}"));
        fs::create_dir_all(wal_dir(&dir))?;
        fs::create_dir_all(shard_dir(&dir))?;

        let manifest_mgr = ManifestManager::new(manifest_path(&dir));
        let manifest = manifest_mgr.load_current()?;

        let memtable = MemTable::new(schema.clone());
        let mut max_lsn = manifest.global_max_lsn;
        let mut reader = WalReader::open(wal_dir(&dir), schema.clone())?;
        while let Some(block) = reader.read_next_block() {
            apply_block(&memtable, &block);
            max_lsn = max_lsn.max(block.lsn);
        }

        let wal_writer = WalWriter::open(
            wal_dir(&dir),
            table_id as u32,
            schema.clone(),
            config.durability,
            config.wal_segment_bytes,
            max_lsn + 1,
        )?;

        Ok(PersistentTable {
            schema,
            table_id,
            dir,
            wal_writer: parking_lot::Mutex::new(wal_writer),
            memtable,
            manifest_mgr,
            refcounter: Arc::new(RefCounter::new()),
            next_lsn: AtomicU64::new(max_lsn + 1),
            shard_counter: AtomicU64::new(manifest.entries.len() as u64),
            memtable_capacity_bytes: config.memtable_capacity_bytes,
            compaction_overlap_threshold: config.compaction_overlap_threshold,
        })
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Append `batch` to the WAL, then merge it into the MemTable
    /// [spec §4.9 "ingest_batch"]. Triggers a flush (and, if warranted,
    /// a compaction) once the MemTable crosses its capacity.
    pub fn ingest_batch(&self, batch: &ZSetBatch) -> Result<()> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let entries: Vec<WalEntry> = batch
            .iter()
            .map(|(pk, weight, row)| WalEntry {
                pk_lo: pk.0,
                pk_hi: pk.1,
                weight,
                row: row.clone(),
            })
            .collect();
        self.wal_writer.lock().append_block(lsn, &entries)?;
        self.memtable.upsert_batch(batch);

        if self.memtable_size_estimate() >= self.memtable_capacity_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Rough per-row estimate; a full byte-accurate accounting would
    /// need every row's encoded width, which the MemTable (an AoS
    /// in-memory structure) does not track.
    fn memtable_size_estimate(&self) -> usize {
        self.memtable.len() * (self.schema.stride() + 32)
    }

    /// Flush the MemTable to a new shard, publish the updated manifest,
    /// and free the MemTable's memory [spec §4.9 "flush"].
    pub fn flush(&self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        let shard_index = self.shard_counter.fetch_add(1, Ordering::SeqCst);
        let filename = format!("shard-{shard_index:010}.gdb");
        let path = shard_dir(&self.dir).join(&filename);
        self.memtable.flush_to_shard(&path, self.table_id)?;

        let rows = self.memtable.snapshot();
        let min_pk = rows.first().map(|(pk, _, _)| *pk).unwrap_or((0, 0));
        let max_pk = rows.last().map(|(pk, _, _)| *pk).unwrap_or((0, 0));
        let max_lsn = self.next_lsn.load(Ordering::SeqCst).saturating_sub(1);

        let mut manifest = self.manifest_mgr.load_current()?;
        manifest.version += 1;
        manifest.global_max_lsn = manifest.global_max_lsn.max(max_lsn);
        manifest.entries.push(crate::manifest::ManifestEntry {
            table_id: self.table_id,
            filename,
            min_pk,
            max_pk,
            min_lsn: 0,
            max_lsn,
        });
        self.manifest_mgr.publish_new_version(&manifest)?;
        self.memtable.free();

        info!(table_id = self.table_id, "flushed memtable to shard");

        if should_compact(
            manifest.entries.len(),
            self.compaction_overlap_threshold,
            1.0,
            self.compaction_overlap_threshold as f64,
        ) {
            self.compact_all()?;
        }
        Ok(())
    }

    /// Compact every currently live shard into one [spec §4.8].
    pub fn compact_all(&self) -> Result<()> {
        let manifest = self.manifest_mgr.load_current()?;
        if manifest.entries.len() < 2 {
            return Ok(());
        }
        let inputs: Vec<String> = manifest.entries.iter().map(|e| e.filename.clone()).collect();
        let output_index = self.shard_counter.fetch_add(1, Ordering::SeqCst);
        let output = format!("shard-{output_index:010}.gdb");
        let compactor = Compactor::new(self.schema.clone(), self.table_id, shard_dir(&self.dir));
        compactor.compact(&inputs, &output, &manifest, &self.manifest_mgr, &self.refcounter)
    }

    /// Net weight of the exact `(pk, payload)` pair, summed across the
    /// MemTable and every live shard [spec §4.9 "get_weight"].
    pub fn get_weight(&self, pk: (u64, u64), row: &PayloadRow) -> Result<i64> {
        let mut total = self.memtable.find_exact(pk, row);
        let manifest = self.manifest_mgr.load_current()?;
        for entry in &manifest.entries {
            let path = shard_dir(&self.dir).join(&entry.filename);
            let view = ShardView::open(&path, self.schema.clone())?;
            if let Some(idx) = view.find_row_index(pk) {
                if &view.get_row(idx)? == row {
                    total += view.get_weight(idx);
                }
            }
        }
        Ok(total)
    }

    /// Open a streaming merge cursor over the MemTable and every
    /// currently live shard [spec §4.9 "create_cursor"].
    pub fn create_cursor(&self) -> Result<UnifiedCursor> {
        let manifest = self.manifest_mgr.load_current()?;
        let mut shards = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let path = shard_dir(&self.dir).join(&entry.filename);
            let view = Arc::new(ShardView::open(&path, self.schema.clone())?);
            shards.push((view, path));
        }
        UnifiedCursor::open(Some(&self.memtable), shards, self.refcounter.clone())
    }
}

fn apply_block(memtable: &MemTable, block: &DecodedBlock) {
    let mut batch = ZSetBatch::new(memtable.schema().clone());
    for (pk_lo, pk_hi, weight, row) in &block.entries {
        batch.append(*pk_lo, *pk_hi, *weight, Arc::new(row.clone()));
    }
    memtable.upsert_batch(&batch);
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
    fn ingest_then_read_back_via_get_weight() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let schema = schema();
        let table = PersistentTable::open(&config, schema.clone(), 1).unwrap();

        let r = row(&schema, "alice");
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, 1, r.clone());
        table.ingest_batch(&batch).unwrap();

        assert_eq!(table.get_weight((1, 0), &r).unwrap(), 1);
    }

    #[test]
    fn flush_then_cursor_sees_shard_rows() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let schema = schema();
        let table = PersistentTable::open(&config, schema.clone(), 1).unwrap();

        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, 1, row(&schema, "alice"));
        table.ingest_batch(&batch).unwrap();
        table.flush().unwrap();

        let mut cursor = table.create_cursor().unwrap();
        assert!(cursor.is_valid());
        assert_eq!(cursor.get_accessor().unwrap().get_str(1), "alice");
    }

    #[test]
    fn recovers_memtable_contents_from_wal_on_reopen() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let schema = schema();
        let r = row(&schema, "alice");
        {
            let table = PersistentTable::open(&config, schema.clone(), 1).unwrap();
            let mut batch = ZSetBatch::new(schema.clone());
            batch.append(1, 0, 1, r.clone());
            table.ingest_batch(&batch).unwrap();
        }
        let reopened = PersistentTable::open(&config, schema, 1).unwrap();
        assert_eq!(reopened.get_weight((1, 0), &r).unwrap(), 1);
    }
}
