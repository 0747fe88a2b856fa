//! Columnar shard reader [spec §4.5 "Reader `ShardView`"].
//!
//! Memory-maps the file read-only. The PK and weight regions are
//! validated eagerly on open (every query needs them); column and blob
//! regions validate lazily, on first access, via a per-region flag —
//! this keeps `open` O(1) and defers checksum work to the query that
//! actually touches a region.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use gnitzdb_core::{FieldType, PayloadRow, PayloadRowBuilder, PayloadSlot, TableSchema};
use memmap2::Mmap;

use crate::checksum::checksum;
use crate::error::{Result, StorageError};
use crate::shard::format::{RegionEntry, RegionLayout, DIR_ENTRY_SIZE, HEADER_SIZE, MAGIC};

struct Region {
    entry: RegionEntry,
    validated: Cell<bool>,
}

/// A read-only, memory-mapped view of one shard file.
pub struct ShardView {
    path: PathBuf,
    mmap: Mmap,
    schema: Arc<TableSchema>,
    layout: RegionLayout,
    row_count: usize,
    table_id: u64,
    regions: Vec<Region>,
    find_hits: AtomicU64,
    find_misses: AtomicU64,
}

impl ShardView {
    pub fn open(path: impl AsRef<Path>, schema: Arc<TableSchema>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(StorageError::CorruptShard {
                path,
                region: "header",
            });
        }
        let magic = LittleEndian::read_u64(&mmap[0..8]);
        if magic != MAGIC {
            return Err(StorageError::CorruptShard {
                path,
                region: "header",
            });
        }
        let row_count = LittleEndian::read_u64(&mmap[16..24]) as usize;
        let directory_offset = LittleEndian::read_u64(&mmap[24..32]) as usize;
        let table_id = LittleEndian::read_u64(&mmap[32..40]);

        let layout = RegionLayout::for_schema(&schema);
        let mut regions = Vec::with_capacity(layout.num_regions);
        for i in 0..layout.num_regions {
            let off = directory_offset + i * DIR_ENTRY_SIZE;
            if off + DIR_ENTRY_SIZE > mmap.len() {
                return Err(StorageError::CorruptShard {
                    path,
                    region: "directory",
                });
            }
            let entry = RegionEntry {
                offset: LittleEndian::read_u64(&mmap[off..off + 8]),
                size: LittleEndian::read_u64(&mmap[off + 8..off + 16]),
                checksum: LittleEndian::read_u64(&mmap[off + 16..off + 24]),
            };
            regions.push(Region {
                entry,
                validated: Cell::new(false),
            });
        }

        let view = ShardView {
            path,
            mmap,
            schema,
            layout,
            row_count,
            table_id,
            regions,
            find_hits: AtomicU64::new(0),
            find_misses: AtomicU64::new(0),
        };
        view.validate_region(0)?; // PK
        view.validate_region(1)?; // weight
        Ok(view)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    fn region_bytes(&self, idx: usize) -> &[u8] {
        let e = self.regions[idx].entry;
        &self.mmap[e.offset as usize..e.offset as usize + e.size as usize]
    }

    fn validate_region(&self, idx: usize) -> Result<()> {
        let region = &self.regions[idx];
        if region.validated.get() {
            return Ok(());
        }
        let bytes = self.region_bytes(idx);
        if checksum(bytes) != region.entry.checksum {
            return Err(StorageError::CorruptShard {
                path: self.path.clone(),
                region: region_name(idx, &self.layout),
            });
        }
        region.validated.set(true);
        Ok(())
    }

    pub fn get_pk(&self, i: usize) -> (u64, u64) {
        let bytes = self.region_bytes(0);
        let w = self.layout.pk_width;
        let lo = LittleEndian::read_u64(&bytes[i * w..i * w + 8]);
        let hi = if w == 16 {
            LittleEndian::read_u64(&bytes[i * w + 8..i * w + 16])
        } else {
            0
        };
        (lo, hi)
    }

    pub fn get_weight(&self, i: usize) -> i64 {
        let bytes = self.region_bytes(1);
        LittleEndian::read_i64(&bytes[i * 8..i * 8 + 8])
    }

    /// Decode row `i`'s full payload, validating every column/blob
    /// region it touches on first access.
    pub fn get_row(&self, i: usize) -> Result<PayloadRow> {
        let mut builder = PayloadRowBuilder::new(self.schema.clone());
        for (j, (col, column)) in self.schema.payload_columns().enumerate() {
            let region_idx = self.layout.column_region_index(j);
            self.validate_region(region_idx)?;
            let width = self.layout.column_widths[j];
            let bytes = self.region_bytes(region_idx);
            let cell = &bytes[i * width..i * width + width];
            match self.schema.payload_slot(col) {
                PayloadSlot::Int(_) => {
                    let mut buf = [0u8; 8];
                    buf[..width].copy_from_slice(cell);
                    let raw = i64::from_le_bytes(buf);
                    let sign_extended = if is_signed(column.field_type) && width < 8 {
                        let shift = (8 - width) * 8;
                        (raw << shift) >> shift
                    } else {
                        raw
                    };
                    builder.append_int(sign_extended);
                }
                PayloadSlot::Float(_) => {
                    if width == 4 {
                        builder.append_float(LittleEndian::read_f32(cell) as f64);
                    } else {
                        builder.append_float(LittleEndian::read_f64(cell));
                    }
                }
                PayloadSlot::U128(_) => {
                    let lo = LittleEndian::read_u64(&cell[0..8]);
                    let hi = LittleEndian::read_u64(&cell[8..16]);
                    builder.append_u128(lo, hi);
                }
                PayloadSlot::Str(_) => {
                    debug_assert_eq!(column.field_type, FieldType::String);
                    let len = LittleEndian::read_u32(&cell[0..4]) as usize;
                    let prefix_len = len.min(4);
                    let s = if len <= gnitzdb_core::SHORT_STRING_THRESHOLD {
                        let mut buf = Vec::with_capacity(len);
                        buf.extend_from_slice(&cell[4..4 + prefix_len]);
                        if len > 4 {
                            buf.extend_from_slice(&cell[8..8 + (len - 4)]);
                        }
                        String::from_utf8_lossy(&buf).into_owned()
                    } else {
                        let blob_idx = self.layout.blob_region_index();
                        self.validate_region(blob_idx)?;
                        let blob = self.region_bytes(blob_idx);
                        let off = LittleEndian::read_u64(&cell[8..16]) as usize;
                        String::from_utf8_lossy(&blob[off..off + len]).into_owned()
                    };
                    builder.append_string(&s);
                }
            }
        }
        Ok(builder.finish())
    }

    /// Whether row `i`'s string column `col` equals `needle`, using the
    /// inline 4-byte prefix to short-circuit before touching the blob
    /// heap on a prefix mismatch.
    pub fn string_field_equals(&self, i: usize, col: usize, needle: &str) -> Result<bool> {
        let j = match self.schema.payload_slot(col) {
            PayloadSlot::Str(_) => self
                .schema
                .payload_columns()
                .position(|(c, _)| c == col)
                .unwrap(),
            _ => panic!("column {col} is not a string column"),
        };
        let region_idx = self.layout.column_region_index(j);
        self.validate_region(region_idx)?;
        let width = self.layout.column_widths[j];
        let bytes = self.region_bytes(region_idx);
        let cell = &bytes[i * width..i * width + width];
        let len = LittleEndian::read_u32(&cell[0..4]) as usize;
        if len != needle.len() {
            return Ok(false);
        }
        let prefix_len = len.min(4);
        if &cell[4..4 + prefix_len] != &needle.as_bytes()[..prefix_len] {
            return Ok(false);
        }
        Ok(self.get_row(i)?.get_str(col) == needle)
    }

    /// Binary search for `pk` by unsigned `(hi, lo)` order, logging a
    /// hit/miss counter consulted by compaction-trigger heuristics
    /// [spec §4.5, §4.8].
    pub fn find_row_index(&self, pk: (u64, u64)) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_pk = self.get_pk(mid);
            if mid_pk == pk {
                self.find_hits.fetch_add(1, Ordering::Relaxed);
                return Some(mid);
            } else if (mid_pk.1, mid_pk.0) < (pk.1, pk.0) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.find_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn find_hits(&self) -> u64 {
        self.find_hits.load(Ordering::Relaxed)
    }

    pub fn find_misses(&self) -> u64 {
        self.find_misses.load(Ordering::Relaxed)
    }
}

fn is_signed(ft: FieldType) -> bool {
    matches!(ft, FieldType::I8 | FieldType::I16 | FieldType::I32 | FieldType::I64)
}

fn region_name(idx: usize, layout: &RegionLayout) -> &'static str {
    if idx == 0 {
        "pk"
    } else if idx == 1 {
        "weight"
    } else if idx == layout.blob_region_index() {
        "blob"
    } else {
        "column"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::writer::TableShardWriter;
    use gnitzdb_core::Column;
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
    fn write_then_read_back_rows() {
        let schema = schema();
        let mut w = TableShardWriter::new(schema.clone(), 1);
        for (pk, name, score) in [(3u64, "carol", 3i64), (1, "alice", 1), (2, "bob", 2)] {
            let mut b = PayloadRowBuilder::new(schema.clone());
            b.append_string(name);
            b.append_int(score);
            w.add_row(pk, 0, 1, Arc::new(b.finish()));
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.gdb");
        w.finalize(&path).unwrap();

        let view = ShardView::open(&path, schema).unwrap();
        assert_eq!(view.row_count(), 3);
        // sorted by pk ascending
        assert_eq!(view.get_pk(0), (1, 0));
        assert_eq!(view.get_row(0).unwrap().get_str(1), "alice");
        assert_eq!(view.get_pk(2), (3, 0));

        let idx = view.find_row_index((2, 0)).unwrap();
        assert_eq!(view.get_row(idx).unwrap().get_str(1), "bob");
        assert!(view.find_row_index((99, 0)).is_none());
        assert!(view.string_field_equals(idx, 1, "bob").unwrap());
        assert!(!view.string_field_equals(idx, 1, "nope").unwrap());
    }

    #[test]
    fn detects_corrupted_pk_region_eagerly() {
        let schema = schema();
        let mut w = TableShardWriter::new(schema.clone(), 1);
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string("x");
        b.append_int(1);
        w.add_row(1, 0, 1, Arc::new(b.finish()));
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.gdb");
        w.finalize(&path).unwrap();

        // PK is region 0; its data starts right after the header and the
        // (5-region) directory, aligned up to 64.
        let mut bytes = std::fs::read(&path).unwrap();
        let pk_region_start = 192;
        bytes[pk_region_start] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(ShardView::open(&path, schema).is_err());
    }
}
