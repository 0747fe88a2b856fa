//! `UnifiedCursor`: a streaming merge over the MemTable and every live
//! shard of one table, weights summed across layers and net-zero
//! entries skipped inline [spec §3 "UnifiedCursor", §4.13].
//!
//! A classic LSM merge-iterator: one "head" item per layer sits in a
//! min-heap ordered by `(pk, payload)`; equal heads across layers pop
//! together and their weights sum, so a row updated in the MemTable
//! after being flushed to a shard is never double-counted or
//! double-read. Shard layers are refcount-pinned for the cursor's
//! lifetime so compaction can never unlink a file out from under it
//! [spec §4.7].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

use gnitzdb_core::PayloadRow;

use crate::error::Result;
use crate::memtable::MemTable;
use crate::refcount::RefCounter;
use crate::shard::reader::ShardView;

enum Layer {
    Mem(Vec<((u64, u64), i64, Arc<PayloadRow>)>),
    Shard(Arc<ShardView>),
}

impl Layer {
    fn len(&self) -> usize {
        match self {
            Layer::Mem(v) => v.len(),
            Layer::Shard(s) => s.row_count(),
        }
    }

    fn pk_at(&self, i: usize) -> (u64, u64) {
        match self {
            Layer::Mem(v) => v[i].0,
            Layer::Shard(s) => s.get_pk(i),
        }
    }

    fn weight_at(&self, i: usize) -> i64 {
        match self {
            Layer::Mem(v) => v[i].1,
            Layer::Shard(s) => s.get_weight(i),
        }
    }

    fn row_at(&self, i: usize) -> Result<Arc<PayloadRow>> {
        match self {
            Layer::Mem(v) => Ok(v[i].2.clone()),
            Layer::Shard(s) => Ok(Arc::new(s.get_row(i)?)),
        }
    }
}

struct HeapItem {
    pk: (u64, u64),
    row: Arc<PayloadRow>,
    weight: i64,
    layer: usize,
    pos: usize,
}

impl HeapItem {
    fn key_cmp(&self, other: &HeapItem) -> Ordering {
        let (lo_a, hi_a) = self.pk;
        let (lo_b, hi_b) = other.pk;
        match (hi_a, lo_a).cmp(&(hi_b, lo_b)) {
            Ordering::Equal => self.row.cmp_payload(&other.row),
            ord => ord,
        }
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other)
    }
}

/// Merges the MemTable and a fixed set of shard views into one ordered,
/// weight-consolidated stream.
pub struct UnifiedCursor {
    layers: Vec<Layer>,
    pinned_shards: Vec<PathBuf>,
    refcounter: Option<Arc<RefCounter>>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    current: Option<((u64, u64), i64, Arc<PayloadRow>)>,
}

impl UnifiedCursor {
    /// Open a cursor over `memtable`'s current contents plus
    /// `shards`. Every shard is refcount-acquired for the cursor's
    /// lifetime; call [`Self::close`] (or drop the cursor then call
    /// [`RefCounter::release`] yourself) to release them.
    pub fn open(
        memtable: Option<&MemTable>,
        shards: Vec<(Arc<ShardView>, PathBuf)>,
        refcounter: Arc<RefCounter>,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(shards.len() + 1);
        let mut pinned_shards = Vec::with_capacity(shards.len());
        if let Some(mt) = memtable {
            layers.push(Layer::Mem(mt.snapshot()));
        }
        for (view, path) in shards {
            refcounter.acquire(&path);
            pinned_shards.push(path);
            layers.push(Layer::Shard(view));
        }

        let mut heap = BinaryHeap::new();
        for (idx, layer) in layers.iter().enumerate() {
            if layer.len() > 0 {
                heap.push(Reverse(HeapItem {
                    pk: layer.pk_at(0),
                    row: layer.row_at(0)?,
                    weight: layer.weight_at(0),
                    layer: idx,
                    pos: 0,
                }));
            }
        }

        let mut cursor = UnifiedCursor {
            layers,
            pinned_shards,
            refcounter: Some(refcounter),
            heap,
            current: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn push_next(&mut self, layer: usize, pos: usize) -> Result<()> {
        let next_pos = pos + 1;
        if next_pos < self.layers[layer].len() {
            self.heap.push(Reverse(HeapItem {
                pk: self.layers[layer].pk_at(next_pos),
                row: self.layers[layer].row_at(next_pos)?,
                weight: self.layers[layer].weight_at(next_pos),
                layer,
                pos: next_pos,
            }));
        }
        Ok(())
    }

    /// Pop every head matching the heap's current minimum `(pk, payload)`
    /// key, sum their weights, and refill one entry per drained layer.
    /// Repeats while the summed weight is net zero [spec §5.4].
    fn advance(&mut self) -> Result<()> {
        loop {
            let Some(Reverse(first)) = self.heap.pop() else {
                self.current = None;
                return Ok(());
            };
            let mut total = first.weight;
            let pk = first.pk;
            let row = first.row.clone();
            self.push_next(first.layer, first.pos)?;

            while let Some(Reverse(top)) = self.heap.peek() {
                if top.key_cmp(&first) == Ordering::Equal {
                    let Reverse(next) = self.heap.pop().unwrap();
                    total += next.weight;
                    self.push_next(next.layer, next.pos)?;
                } else {
                    break;
                }
            }

            if total != 0 {
                self.current = Some((pk, total, row));
                return Ok(());
            }
        }
    }

    /// Advance past the current entry; the consolidated group it
    /// belonged to has already been fully drained from the heap.
    pub fn advance_cursor(&mut self) -> Result<()> {
        self.advance()
    }

    /// Skip forward until the current key is `>= pk`, or exhaust the
    /// cursor. Only forward movement is supported, matching how scans
    /// use this cursor [spec §4.13 "seek"].
    pub fn seek(&mut self, pk: (u64, u64)) -> Result<()> {
        while let Some((cur_pk, _, _)) = &self.current {
            let (lo, hi) = *cur_pk;
            if (hi, lo) >= (pk.1, pk.0) {
                return Ok(());
            }
            self.advance()?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<(u64, u64)> {
        self.current.as_ref().map(|(pk, _, _)| *pk)
    }

    pub fn weight(&self) -> Option<i64> {
        self.current.as_ref().map(|(_, w, _)| *w)
    }

    pub fn get_accessor(&self) -> Option<&Arc<PayloadRow>> {
        self.current.as_ref().map(|(_, _, row)| row)
    }

    /// Release this cursor's pins on every shard it holds open
    /// [spec §4.7, §4.13].
    pub fn close(mut self) -> Result<()> {
        if let Some(rc) = self.refcounter.take() {
            for path in self.pinned_shards.drain(..) {
                rc.release(&path)?;
            }
        }
        Ok(())
    }
}

impl Drop for UnifiedCursor {
    fn drop(&mut self) {
        if let Some(rc) = self.refcounter.take() {
            for path in self.pinned_shards.drain(..) {
                let _ = rc.release(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::{Column, FieldType, PayloadRowBuilder, TableSchema, ZSetBatch};
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
    fn merges_memtable_and_shard_in_pk_order() {
        let schema = schema();
        let dir = tempdir().unwrap();

        let mut shard_writer = crate::shard::writer::TableShardWriter::new(schema.clone(), 1);
        shard_writer.add_row(1, 0, 1, row(&schema, "alice"));
        shard_writer.add_row(3, 0, 1, row(&schema, "carol"));
        let shard_path = dir.path().join("s0.gdb");
        shard_writer.finalize(&shard_path).unwrap();
        let view = Arc::new(ShardView::open(&shard_path, schema.clone()).unwrap());

        let mt = MemTable::new(schema.clone());
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(2, 0, 1, row(&schema, "bob"));
        mt.upsert_batch(&batch);

        let rc = Arc::new(RefCounter::new());
        let mut cursor =
            UnifiedCursor::open(Some(&mt), vec![(view, shard_path.clone())], rc.clone()).unwrap();

        let mut names = Vec::new();
        while cursor.is_valid() {
            names.push(cursor.get_accessor().unwrap().get_str(1).to_string());
            cursor.advance_cursor().unwrap();
        }
        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert_eq!(rc.refcount(&shard_path), 1);
        cursor.close().unwrap();
        assert_eq!(rc.refcount(&shard_path), 0);
    }

    #[test]
    fn memtable_update_shadows_shard_via_weight_sum() {
        let schema = schema();
        let dir = tempdir().unwrap();

        let mut shard_writer = crate::shard::writer::TableShardWriter::new(schema.clone(), 1);
        let old_row = row(&schema, "alice");
        shard_writer.add_row(1, 0, 1, old_row.clone());
        let shard_path = dir.path().join("s0.gdb");
        shard_writer.finalize(&shard_path).unwrap();
        let view = Arc::new(ShardView::open(&shard_path, schema.clone()).unwrap());

        // retract the old row in the MemTable (net weight for it becomes 0).
        let mt = MemTable::new(schema.clone());
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, -1, old_row);
        mt.upsert_batch(&batch);

        let rc = Arc::new(RefCounter::new());
        let mut cursor =
            UnifiedCursor::open(Some(&mt), vec![(view, shard_path)], rc).unwrap();
        assert!(!cursor.is_valid(), "retraction must cancel the shard row");
    }
}
