//! Shard on-disk layout constants and the region directory
//! [spec §3 "Shard (on disk)", §6 "Shard file format"].
//!
//! ```text
//! header (64 B)
//! directory: num_regions * (offset u64, size u64, checksum u64)  [24 B each]
//! regions, each 64-byte aligned:
//!   pk region      (pk_width * row_count)
//!   weight region  (8 * row_count)
//!   one region per non-PK column, column's own width * row_count
//!   blob heap      (variable, long-string bytes)
//! ```
//!
//! Unlike `PayloadRow`'s AoS (array-of-structs) in-memory layout, a
//! shard is genuinely columnar (struct-of-arrays): each column gets its
//! own contiguous region so a query touching few columns maps only
//! those regions' pages.

use gnitzdb_core::TableSchema;

pub const MAGIC: u64 = 0x3130_5F5A_5449_4E47;
pub const HEADER_SIZE: usize = 64;
pub const REGION_ALIGNMENT: usize = 64;
pub const DIR_ENTRY_SIZE: usize = 24;

pub fn align_region(offset: usize) -> usize {
    gnitzdb_core::align_up(offset, REGION_ALIGNMENT)
}

/// One entry in the region directory.
#[derive(Debug, Clone, Copy)]
pub struct RegionEntry {
    pub offset: u64,
    pub size: u64,
    pub checksum: u64,
}

/// Index of a region within the directory for a given schema: `0` = PK,
/// `1` = weight, `2..2+n` = non-PK columns in schema order,
/// `2+n` = blob heap.
pub struct RegionLayout {
    pub pk_width: usize,
    pub column_widths: Vec<usize>,
    pub num_regions: usize,
}

impl RegionLayout {
    pub fn for_schema(schema: &TableSchema) -> Self {
        let pk_width = if schema.pk_is_u128() { 16 } else { 8 };
        let column_widths: Vec<usize> = schema
            .payload_columns()
            .map(|(_, c)| c.field_type.size())
            .collect();
        let num_regions = 2 + column_widths.len() + 1;
        RegionLayout {
            pk_width,
            column_widths,
            num_regions,
        }
    }

    pub fn blob_region_index(&self) -> usize {
        1 + self.column_widths.len() + 1
    }

    pub fn column_region_index(&self, payload_position: usize) -> usize {
        2 + payload_position
    }
}
