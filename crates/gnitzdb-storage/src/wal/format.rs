//! WAL block wire format [spec §6 "WAL file format"].
//!
//! ```text
//! header (32 B): LSN u64 | table_id u32 | record_count u32 | body_length u32 | reserved u32 | body checksum u64
//! body:          [fixed region: record_count * (pk(8|16) | weight i64 | stride bytes)]
//!                [blob region: long-string bytes, 8-byte aligned]
//! ```
//!
//! A string column's 16-byte slot holds `length u32 | prefix [u8;4] |
//! tail`. When `length <= 12` the tail is the remaining bytes of the
//! string inline (zero-padded); otherwise the tail is an 8-byte offset,
//! relative to the start of the body, into the blob region.
//!
//! Grounded on `gnitz/storage/wal_format.py`'s `write_wal_block`/
//! `decode_wal_block`, with one deliberate change: the original
//! interleaves each record's long strings immediately after that
//! record's fixed stride. This implementation instead batches all long
//! strings into one trailing blob region, matching the wire shape given
//! in spec's external-interfaces section ("long-string bytes appended at
//! the end of the block").

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use gnitzdb_core::{FieldType, GermanString, PayloadRow, PayloadRowBuilder, PayloadSlot, TableSchema};

use crate::checksum::checksum;
use crate::error::{Result, StorageError};

pub const WAL_BLOCK_HEADER_SIZE: usize = 32;

pub fn align_8(v: usize) -> usize {
    (v + 7) & !7
}

/// One logical record to append: primary key (`hi` is 0 for non-u128
/// keys), weight, and payload.
pub struct WalEntry {
    pub pk_lo: u64,
    pub pk_hi: u64,
    pub weight: i64,
    pub row: Arc<PayloadRow>,
}

/// A decoded block, ready for replay into a `MemTable`.
pub struct DecodedBlock {
    pub lsn: u64,
    pub table_id: u32,
    pub entries: Vec<(u64, u64, i64, PayloadRow)>,
}

fn key_size(schema: &TableSchema) -> usize {
    if schema.pk_is_u128() {
        16
    } else {
        8
    }
}

/// Serialize one block's header + body for `entries` against `schema`.
pub fn encode_block(lsn: u64, table_id: u32, schema: &Arc<TableSchema>, entries: &[WalEntry]) -> Vec<u8> {
    let key_sz = key_size(schema);
    let stride = schema.stride();
    let record_fixed_size = key_sz + 8 + stride;

    let mut long_strings: Vec<&[u8]> = Vec::new();
    let mut blob_len = 0usize;
    for e in entries {
        for (col, column) in schema.payload_columns() {
            if column.field_type == FieldType::String && !e.row.is_null(col) {
                let s = e.row.get_str(col);
                if s.len() > gnitzdb_core::SHORT_STRING_THRESHOLD {
                    long_strings.push(s.as_bytes());
                    blob_len = align_8(blob_len + s.len());
                }
            }
        }
    }

    let fixed_region_len = entries.len() * record_fixed_size;
    let body_len = fixed_region_len + blob_len;
    let mut body = vec![0u8; body_len];

    let mut blob_cursor = fixed_region_len;
    let mut long_idx = 0usize;

    for (i, e) in entries.iter().enumerate() {
        let rec_off = i * record_fixed_size;
        LittleEndian::write_u64(&mut body[rec_off..rec_off + 8], e.pk_lo);
        if key_sz == 16 {
            LittleEndian::write_u64(&mut body[rec_off + 8..rec_off + 16], e.pk_hi);
        }
        let weight_off = rec_off + key_sz;
        LittleEndian::write_i64(&mut body[weight_off..weight_off + 8], e.weight);
        let payload_off = weight_off + 8;

        for (col, column) in schema.payload_columns() {
            if e.row.is_null(col) {
                continue;
            }
            let field_off = payload_off + schema.column_offset(col);
            match schema.payload_slot(col) {
                PayloadSlot::Int(_) => {
                    LittleEndian::write_i64(
                        &mut body[field_off..field_off + 8],
                        e.row.get_int_signed(col),
                    );
                }
                PayloadSlot::Float(_) => {
                    LittleEndian::write_f64(&mut body[field_off..field_off + 8], e.row.get_float(col));
                }
                PayloadSlot::U128(_) => {
                    let (lo, hi) = e.row.get_u128_parts(col);
                    LittleEndian::write_u64(&mut body[field_off..field_off + 8], lo);
                    LittleEndian::write_u64(&mut body[field_off + 8..field_off + 16], hi);
                }
                PayloadSlot::Str(_) => {
                    debug_assert_eq!(column.field_type, FieldType::String);
                    let s = e.row.get_str(col);
                    LittleEndian::write_u32(&mut body[field_off..field_off + 4], s.len() as u32);
                    let prefix_len = s.len().min(4);
                    body[field_off + 4..field_off + 4 + prefix_len]
                        .copy_from_slice(&s.as_bytes()[..prefix_len]);
                    if s.len() <= gnitzdb_core::SHORT_STRING_THRESHOLD {
                        let tail = &s.as_bytes()[prefix_len..];
                        body[field_off + 8..field_off + 8 + tail.len()].copy_from_slice(tail);
                    } else {
                        let bytes = long_strings[long_idx];
                        long_idx += 1;
                        body[blob_cursor..blob_cursor + bytes.len()].copy_from_slice(bytes);
                        LittleEndian::write_u64(
                            &mut body[field_off + 8..field_off + 16],
                            blob_cursor as u64,
                        );
                        blob_cursor = align_8(blob_cursor + bytes.len());
                    }
                }
            }
        }
    }

    let body_checksum = checksum(&body);
    let mut out = vec![0u8; WAL_BLOCK_HEADER_SIZE + body.len()];
    LittleEndian::write_u64(&mut out[0..8], lsn);
    LittleEndian::write_u32(&mut out[8..12], table_id);
    LittleEndian::write_u32(&mut out[12..16], entries.len() as u32);
    LittleEndian::write_u32(&mut out[16..20], (WAL_BLOCK_HEADER_SIZE + body.len()) as u32);
    LittleEndian::write_u32(&mut out[20..24], 0);
    LittleEndian::write_u64(&mut out[24..32], body_checksum);
    out[WAL_BLOCK_HEADER_SIZE..].copy_from_slice(&body);
    out
}

/// Decode one block from `bytes` (header + body, exactly
/// `body_length` bytes as recorded in the header).
pub fn decode_block(bytes: &[u8], schema: &Arc<TableSchema>, path: &Path) -> Result<DecodedBlock> {
    if bytes.len() < WAL_BLOCK_HEADER_SIZE {
        return Err(StorageError::CorruptWalSegment {
            path: path.to_path_buf(),
            reason: "block shorter than header".to_string(),
        });
    }
    let lsn = LittleEndian::read_u64(&bytes[0..8]);
    let table_id = LittleEndian::read_u32(&bytes[8..12]);
    let record_count = LittleEndian::read_u32(&bytes[12..16]) as usize;
    let body_length = LittleEndian::read_u32(&bytes[16..20]) as usize;
    let stored_checksum = LittleEndian::read_u64(&bytes[24..32]);

    if bytes.len() < body_length {
        return Err(StorageError::CorruptWalSegment {
            path: path.to_path_buf(),
            reason: "truncated block body".to_string(),
        });
    }
    let body = &bytes[WAL_BLOCK_HEADER_SIZE..body_length];
    if checksum(body) != stored_checksum {
        return Err(StorageError::CorruptWalSegment {
            path: path.to_path_buf(),
            reason: "body checksum mismatch".to_string(),
        });
    }

    let key_sz = key_size(schema);
    let stride = schema.stride();
    let record_fixed_size = key_sz + 8 + stride;

    let mut entries = Vec::with_capacity(record_count);
    for i in 0..record_count {
        let rec_off = i * record_fixed_size;
        if rec_off + record_fixed_size > body.len() {
            return Err(StorageError::CorruptWalSegment {
                path: path.to_path_buf(),
                reason: "record runs past body end".to_string(),
            });
        }
        let pk_lo = LittleEndian::read_u64(&body[rec_off..rec_off + 8]);
        let pk_hi = if key_sz == 16 {
            LittleEndian::read_u64(&body[rec_off + 8..rec_off + 16])
        } else {
            0
        };
        let weight_off = rec_off + key_sz;
        let weight = LittleEndian::read_i64(&body[weight_off..weight_off + 8]);
        let payload_off = weight_off + 8;

        let mut builder = PayloadRowBuilder::new(schema.clone());
        for (col, column) in schema.payload_columns() {
            let field_off = payload_off + schema.column_offset(col);
            match column.field_type {
                ft if ft.is_integer() => {
                    builder.append_int(LittleEndian::read_i64(&body[field_off..field_off + 8]));
                }
                ft if ft.is_float() => {
                    builder.append_float(LittleEndian::read_f64(&body[field_off..field_off + 8]));
                }
                FieldType::U128 => {
                    let lo = LittleEndian::read_u64(&body[field_off..field_off + 8]);
                    let hi = LittleEndian::read_u64(&body[field_off + 8..field_off + 16]);
                    builder.append_u128(lo, hi);
                }
                FieldType::String => {
                    let len = LittleEndian::read_u32(&body[field_off..field_off + 4]) as usize;
                    let s = if len <= gnitzdb_core::SHORT_STRING_THRESHOLD {
                        let prefix_len = len.min(4);
                        let mut buf = Vec::with_capacity(len);
                        buf.extend_from_slice(&body[field_off + 4..field_off + 4 + prefix_len]);
                        if len > 4 {
                            buf.extend_from_slice(&body[field_off + 8..field_off + 8 + (len - 4)]);
                        }
                        String::from_utf8_lossy(&buf).into_owned()
                    } else {
                        let blob_off = LittleEndian::read_u64(&body[field_off + 8..field_off + 16]) as usize;
                        if blob_off + len > body.len() {
                            return Err(StorageError::CorruptWalSegment {
                                path: path.to_path_buf(),
                                reason: "long string blob out of range".to_string(),
                            });
                        }
                        String::from_utf8_lossy(&body[blob_off..blob_off + len]).into_owned()
                    };
                    builder.append_string(&s);
                }
                _ => unreachable!("unhandled field type"),
            }
        }
        let row = builder.finish();
        entries.push((pk_lo, pk_hi, weight, row));
    }

    let _ = GermanString::new("");
    Ok(DecodedBlock {
        lsn,
        table_id,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::Column;

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

    fn row(schema: &Arc<TableSchema>, name: &str, score: i64) -> Arc<PayloadRow> {
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string(name);
        b.append_int(score);
        Arc::new(b.finish())
    }

    #[test]
    fn roundtrip_short_strings() {
        let schema = schema();
        let entries = vec![WalEntry {
            pk_lo: 1,
            pk_hi: 0,
            weight: 1,
            row: row(&schema, "hi", 7),
        }];
        let bytes = encode_block(42, 3, &schema, &entries);
        let decoded = decode_block(&bytes, &schema, Path::new("test")).unwrap();
        assert_eq!(decoded.lsn, 42);
        assert_eq!(decoded.table_id, 3);
        assert_eq!(decoded.entries.len(), 1);
        let (pk_lo, _, weight, row) = &decoded.entries[0];
        assert_eq!(*pk_lo, 1);
        assert_eq!(*weight, 1);
        assert_eq!(row.get_str(1), "hi");
        assert_eq!(row.get_int_signed(2), 7);
    }

    #[test]
    fn roundtrip_long_string_via_blob_region() {
        let schema = schema();
        let long_name = "this name is definitely longer than twelve bytes";
        let entries = vec![WalEntry {
            pk_lo: 9,
            pk_hi: 0,
            weight: -3,
            row: row(&schema, long_name, -1),
        }];
        let bytes = encode_block(1, 1, &schema, &entries);
        let decoded = decode_block(&bytes, &schema, Path::new("test")).unwrap();
        assert_eq!(decoded.entries[0].3.get_str(1), long_name);
        assert_eq!(decoded.entries[0].2, -3);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let schema = schema();
        let entries = vec![WalEntry {
            pk_lo: 1,
            pk_hi: 0,
            weight: 1,
            row: row(&schema, "hi", 7),
        }];
        let mut bytes = encode_block(1, 1, &schema, &entries);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode_block(&bytes, &schema, Path::new("test")).is_err());
    }
}
