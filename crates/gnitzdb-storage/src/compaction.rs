//! N-way tournament-merge compaction: the point where the Ghost
//! Property is physically enforced on disk [spec §3 "Compaction",
//! §4.8].
//!
//! Reads every input shard through one merge (the same min-heap
//! tournament idiom as [`crate::cursor::UnifiedCursor`], minus the
//! MemTable layer), sums weights across shards for identical
//! `(pk, payload)` groups, and writes only the surviving non-zero
//! groups to one new "guard" shard. The new shard and its manifest are
//! published atomically; the inputs are then marked for deletion and
//! swept by [`RefCounter::try_cleanup`] once any cursor still reading
//! them releases its pin.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema};
use tracing::info;

use crate::error::Result;
use crate::manifest::{Manifest, ManifestEntry, ManifestManager};
use crate::refcount::RefCounter;
use crate::shard::reader::ShardView;
use crate::shard::writer::TableShardWriter;

struct HeapItem {
    pk: (u64, u64),
    row: Arc<PayloadRow>,
    weight: i64,
    shard: usize,
    pos: usize,
}

impl HeapItem {
    fn key_cmp(&self, other: &HeapItem) -> Ordering {
        let (lo_a, hi_a) = self.pk;
        let (lo_b, hi_b) = other.pk;
        match (hi_a, lo_a).cmp(&(hi_b, lo_b)) {
            Ordering::Equal => self.row.cmp_payload(&other.row),
            // Ties (identical pk and payload across shards) favor the
            // shard listed later in `inputs`, i.e. the newer one.
            ord => ord,
        }
    }
}
impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal && self.shard == other.shard
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
        match self.key_cmp(other) {
            Ordering::Equal => self.shard.cmp(&other.shard),
            ord => ord,
        }
    }
}

/// Drives compaction of a fixed set of a table's live shards into one
/// new shard, honoring the Ghost Property.
pub struct Compactor {
    schema: Arc<TableSchema>,
    table_id: u64,
    shard_dir: PathBuf,
}

impl Compactor {
    pub fn new(schema: Arc<TableSchema>, table_id: u64, shard_dir: impl Into<PathBuf>) -> Self {
        Compactor {
            schema,
            table_id,
            shard_dir: shard_dir.into(),
        }
    }

    /// Compact `input_filenames` (must all be entries of
    /// `current_manifest`) into one new shard, publish the resulting
    /// manifest, and mark the inputs for deletion.
    pub fn compact(
        &self,
        input_filenames: &[String],
        output_filename: &str,
        current_manifest: &Manifest,
        manifest_mgr: &ManifestManager,
        refcounter: &RefCounter,
    ) -> Result<()> {
        let inputs: Vec<&ManifestEntry> = current_manifest
            .entries
            .iter()
            .filter(|e| input_filenames.contains(&e.filename))
            .collect();

        let mut views = Vec::with_capacity(inputs.len());
        for entry in &inputs {
            let path = self.shard_dir.join(&entry.filename);
            views.push(ShardView::open(&path, self.schema.clone())?);
        }

        let merged = self.merge(&views)?;

        let other_entries: Vec<ManifestEntry> = current_manifest
            .entries
            .iter()
            .filter(|e| !input_filenames.contains(&e.filename))
            .cloned()
            .collect();

        let min_lsn = inputs.iter().map(|e| e.min_lsn).min().unwrap_or(0);
        let max_lsn = inputs.iter().map(|e| e.max_lsn).max().unwrap_or(0);

        let mut new_entries = other_entries;
        if !merged.is_empty() {
            let output_path = self.shard_dir.join(output_filename);
            let mut writer = TableShardWriter::new(self.schema.clone(), self.table_id);
            for (pk, weight, row) in &merged {
                writer.add_row(pk.0, pk.1, *weight, row.clone());
            }
            writer.finalize(&output_path)?;

            let min_pk = merged.first().unwrap().0;
            let max_pk = merged.last().unwrap().0;
            new_entries.push(ManifestEntry {
                table_id: self.table_id,
                filename: output_filename.to_string(),
                min_pk,
                max_pk,
                min_lsn,
                max_lsn,
            });
        }

        let new_manifest = Manifest {
            version: current_manifest.version + 1,
            global_max_lsn: current_manifest.global_max_lsn.max(max_lsn),
            entries: new_entries,
        };
        manifest_mgr.publish_new_version(&new_manifest)?;

        for entry in &inputs {
            refcounter.mark_for_deletion(&self.shard_dir.join(&entry.filename));
        }
        refcounter.try_cleanup()?;

        info!(
            table_id = self.table_id,
            inputs = inputs.len(),
            survivors = merged.len(),
            "compaction complete"
        );
        Ok(())
    }

    /// Tournament-merge every input shard, summing weights for
    /// identical `(pk, payload)` groups and dropping net-zero groups.
    fn merge(&self, views: &[ShardView]) -> Result<Vec<((u64, u64), i64, Arc<PayloadRow>)>> {
        let mut heap = BinaryHeap::new();
        for (idx, view) in views.iter().enumerate() {
            if view.row_count() > 0 {
                heap.push(Reverse(HeapItem {
                    pk: view.get_pk(0),
                    row: Arc::new(view.get_row(0)?),
                    weight: view.get_weight(0),
                    shard: idx,
                    pos: 0,
                }));
            }
        }

        let mut out = Vec::new();
        while let Some(Reverse(first)) = heap.pop() {
            let mut total = first.weight;
            let pk = first.pk;
            let row = first.row.clone();
            push_next(&mut heap, views, first.shard, first.pos)?;

            while let Some(Reverse(top)) = heap.peek() {
                if top.key_cmp(&first) == Ordering::Equal {
                    let Reverse(next) = heap.pop().unwrap();
                    total += next.weight;
                    push_next(&mut heap, views, next.shard, next.pos)?;
                } else {
                    break;
                }
            }

            if total != 0 {
                out.push((pk, total, row));
            }
        }
        Ok(out)
    }
}

fn push_next(
    heap: &mut BinaryHeap<Reverse<HeapItem>>,
    views: &[ShardView],
    shard: usize,
    pos: usize,
) -> Result<()> {
    let next_pos = pos + 1;
    if next_pos < views[shard].row_count() {
        heap.push(Reverse(HeapItem {
            pk: views[shard].get_pk(next_pos),
            row: Arc::new(views[shard].get_row(next_pos)?),
            weight: views[shard].get_weight(next_pos),
            shard,
            pos: next_pos,
        }));
    }
    Ok(())
}

/// Heuristics deciding when a table's shard set is due for compaction
/// [spec §4.8 "compaction triggers"]: too many overlapping shards, or
/// read amplification (shard-opens per logical row) above threshold.
pub fn should_compact(
    live_shard_count: usize,
    overlap_threshold: usize,
    read_amplification: f64,
    read_amp_threshold: f64,
) -> bool {
    live_shard_count >= overlap_threshold || read_amplification >= read_amp_threshold
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

    fn write_shard(schema: &Arc<TableSchema>, path: &Path, rows: &[(u64, i64, &str)]) {
        let mut w = TableShardWriter::new(schema.clone(), 1);
        for &(pk, weight, name) in rows {
            w.add_row(pk, 0, weight, row(schema, name));
        }
        w.finalize(path).unwrap();
    }

    #[test]
    fn compaction_drops_net_zero_and_keeps_survivors() {
        let schema = schema();
        let dir = tempdir().unwrap();

        write_shard(&schema, &dir.path().join("a.gdb"), &[(1, 1, "alice"), (2, 1, "bob")]);
        write_shard(&schema, &dir.path().join("b.gdb"), &[(1, -1, "alice"), (3, 1, "carol")]);

        let manifest = Manifest {
            version: 1,
            global_max_lsn: 10,
            entries: vec![
                ManifestEntry {
                    table_id: 1,
                    filename: "a.gdb".to_string(),
                    min_pk: (1, 0),
                    max_pk: (2, 0),
                    min_lsn: 0,
                    max_lsn: 5,
                },
                ManifestEntry {
                    table_id: 1,
                    filename: "b.gdb".to_string(),
                    min_pk: (1, 0),
                    max_pk: (3, 0),
                    min_lsn: 6,
                    max_lsn: 10,
                },
            ],
        };

        let manifest_mgr = ManifestManager::new(dir.path().join("CURRENT"));
        let refcounter = RefCounter::new();
        let compactor = Compactor::new(schema.clone(), 1, dir.path());
        compactor
            .compact(
                &["a.gdb".to_string(), "b.gdb".to_string()],
                "c.gdb",
                &manifest,
                &manifest_mgr,
                &refcounter,
            )
            .unwrap();

        let published = manifest_mgr.load_current().unwrap();
        assert_eq!(published.entries.len(), 1);
        assert_eq!(published.entries[0].filename, "c.gdb");
        assert!(!dir.path().join("a.gdb").exists());
        assert!(!dir.path().join("b.gdb").exists());

        let view = ShardView::open(dir.path().join("c.gdb"), schema).unwrap();
        assert_eq!(view.row_count(), 2);
        assert_eq!(view.get_pk(0), (2, 0));
        assert_eq!(view.get_pk(1), (3, 0));
    }

    #[test]
    fn should_compact_triggers_on_overlap_or_read_amp() {
        assert!(should_compact(5, 4, 1.0, 2.0));
        assert!(should_compact(1, 4, 3.0, 2.0));
        assert!(!should_compact(1, 4, 1.0, 2.0));
    }
}
