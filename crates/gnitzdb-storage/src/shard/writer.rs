//! Columnar shard writer [spec §4.5 "Writer `TableShardWriter`"].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use gnitzdb_core::{FieldType, PayloadRow, PayloadSlot, TableSchema, ZSetBatch};
use tracing::info;

use crate::checksum::checksum;
use crate::error::Result;
use crate::shard::format::{align_region, RegionLayout, DIR_ENTRY_SIZE, HEADER_SIZE, MAGIC};

/// Accumulates rows, then writes one immutable shard file.
///
/// Rows are staged into a [`ZSetBatch`] and sorted by `(pk, payload)` at
/// finalize time, matching the order a `MemTable` flush or a compaction
/// merge already produces. Long strings are relocated into the shard's
/// own blob heap through a content-addressed dedup cache keyed by
/// `(checksum, length)` — identical strings across rows share one blob
/// entry [spec §4.5 "O(1) content-addressed dedup cache"].
pub struct TableShardWriter {
    schema: Arc<TableSchema>,
    table_id: u64,
    staged: ZSetBatch,
}

impl TableShardWriter {
    pub fn new(schema: Arc<TableSchema>, table_id: u64) -> Self {
        TableShardWriter {
            staged: ZSetBatch::new(schema.clone()),
            schema,
            table_id,
        }
    }

    /// Stage one row. Rows with weight `0` are never written
    /// [spec §3 "Shard (on disk)" invariant].
    pub fn add_row(&mut self, pk_lo: u64, pk_hi: u64, weight: i64, row: Arc<PayloadRow>) {
        if weight == 0 {
            return;
        }
        self.staged.append(pk_lo, pk_hi, weight, row);
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Write the shard to `path`: a `.tmp` file, fsynced, then renamed
    /// atomically over `path`, then the parent directory is fsynced
    /// [spec §4.5 "finalize"].
    pub fn finalize(mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.staged.sort();
        let row_count = self.staged.len();
        let layout = RegionLayout::for_schema(&self.schema);

        let mut pk_region = vec![0u8; layout.pk_width * row_count];
        let mut weight_region = vec![0u8; 8 * row_count];
        let mut column_regions: Vec<Vec<u8>> = layout
            .column_widths
            .iter()
            .map(|w| vec![0u8; w * row_count])
            .collect();
        let mut blob_region: Vec<u8> = Vec::new();
        let mut blob_cache: HashMap<(u64, usize), u64> = HashMap::new();

        for (i, (pk, weight, row)) in self.staged.iter().enumerate() {
            LittleEndian::write_u64(&mut pk_region[i * layout.pk_width..i * layout.pk_width + 8], pk.0);
            if layout.pk_width == 16 {
                LittleEndian::write_u64(
                    &mut pk_region[i * layout.pk_width + 8..i * layout.pk_width + 16],
                    pk.1,
                );
            }
            LittleEndian::write_i64(&mut weight_region[i * 8..i * 8 + 8], weight);

            for (j, (col, column)) in self.schema.payload_columns().enumerate() {
                let width = layout.column_widths[j];
                let region = &mut column_regions[j];
                let cell = &mut region[i * width..i * width + width];
                if row.is_null(col) {
                    continue;
                }
                match self.schema.payload_slot(col) {
                    PayloadSlot::Int(_) => {
                        let bits = row.get_int_signed(col).to_le_bytes();
                        cell.copy_from_slice(&bits[..width]);
                    }
                    PayloadSlot::Float(_) => {
                        if width == 4 {
                            LittleEndian::write_f32(cell, row.get_float(col) as f32);
                        } else {
                            LittleEndian::write_f64(cell, row.get_float(col));
                        }
                    }
                    PayloadSlot::U128(_) => {
                        let (lo, hi) = row.get_u128_parts(col);
                        LittleEndian::write_u64(&mut cell[0..8], lo);
                        LittleEndian::write_u64(&mut cell[8..16], hi);
                    }
                    PayloadSlot::Str(_) => {
                        debug_assert_eq!(column.field_type, FieldType::String);
                        let s = row.get_str(col);
                        LittleEndian::write_u32(&mut cell[0..4], s.len() as u32);
                        let prefix_len = s.len().min(4);
                        cell[4..4 + prefix_len].copy_from_slice(&s.as_bytes()[..prefix_len]);
                        if s.len() <= gnitzdb_core::SHORT_STRING_THRESHOLD {
                            let tail = &s.as_bytes()[prefix_len..];
                            cell[8..8 + tail.len()].copy_from_slice(tail);
                        } else {
                            let key = (checksum(s.as_bytes()), s.len());
                            let offset = *blob_cache.entry(key).or_insert_with(|| {
                                let off = blob_region.len() as u64;
                                blob_region.extend_from_slice(s.as_bytes());
                                off
                            });
                            LittleEndian::write_u64(&mut cell[8..16], offset);
                        }
                    }
                }
            }
        }

        let mut regions: Vec<Vec<u8>> = Vec::with_capacity(layout.num_regions);
        regions.push(pk_region);
        regions.push(weight_region);
        regions.extend(column_regions);
        regions.push(blob_region);

        let dir_size = layout.num_regions * DIR_ENTRY_SIZE;
        let mut cursor = align_region(HEADER_SIZE + dir_size);
        let mut offsets = Vec::with_capacity(regions.len());
        for region in &regions {
            offsets.push(cursor);
            cursor = align_region(cursor + region.len());
        }
        let total_len = cursor;

        let mut out = vec![0u8; total_len];
        LittleEndian::write_u64(&mut out[0..8], MAGIC);
        LittleEndian::write_u64(&mut out[8..16], 1); // version
        LittleEndian::write_u64(&mut out[16..24], row_count as u64);
        LittleEndian::write_u64(&mut out[24..32], HEADER_SIZE as u64); // directory offset
        LittleEndian::write_u64(&mut out[32..40], self.table_id);

        for (i, (region, &offset)) in regions.iter().zip(offsets.iter()).enumerate() {
            let dir_off = HEADER_SIZE + i * DIR_ENTRY_SIZE;
            let cs = checksum(region);
            LittleEndian::write_u64(&mut out[dir_off..dir_off + 8], offset as u64);
            LittleEndian::write_u64(&mut out[dir_off + 8..dir_off + 16], region.len() as u64);
            LittleEndian::write_u64(&mut out[dir_off + 16..dir_off + 24], cs);
            out[offset..offset + region.len()].copy_from_slice(region);
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp_path)?;
            f.write_all(&out)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        info!(path = ?path, rows = row_count, "finalized shard");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::{Column, PayloadRowBuilder};
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("name", FieldType::String),
                Column::new("score", FieldType::I64),
            ],
            0,
        )
        .unwrap()
    }

    #[test]
    fn finalize_writes_a_file() {
        let schema = schema();
        let mut w = TableShardWriter::new(schema.clone(), 1);
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string("alice");
        b.append_int(10);
        w.add_row(1, 0, 1, Arc::new(b.finish()));

        let dir = tempdir().unwrap();
        let path = dir.path().join("shard-0.gdb");
        w.finalize(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn zero_weight_rows_are_skipped() {
        let schema = schema();
        let mut w = TableShardWriter::new(schema.clone(), 1);
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string("x");
        b.append_int(0);
        w.add_row(1, 0, 0, Arc::new(b.finish()));
        assert_eq!(w.len(), 0);
    }
}
