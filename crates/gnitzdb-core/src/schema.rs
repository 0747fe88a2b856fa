//! Table schema: an ordered column list with a designated primary key,
//! immutable after construction and shared by reference [spec §3 "Schema"].

use std::sync::Arc;

use crate::error::LayoutError;
use crate::types::{align_up, FieldType};

/// One column in a [`TableSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    /// Optional foreign-key target: `(table_id, col_idx)`.
    pub fk_target: Option<(u64, usize)>,
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Column {
            name: name.into(),
            field_type,
            nullable: false,
            fk_target: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn references(mut self, table_id: u64, col_idx: usize) -> Self {
        self.fk_target = Some((table_id, col_idx));
        self
    }
}

/// Validate a table/column/view identifier.
///
/// Grounded on the original `gnitz/catalog/identifiers.py` grammar:
/// ASCII letter or underscore start, alphanumeric/underscore
/// continuation, length in `1..=128`. This is the concrete shape of the
/// `LayoutError::InvalidIdentifier` variant named but not specified by
/// [spec §7].
pub fn validate_identifier(name: &str) -> Result<(), LayoutError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return Err(LayoutError::InvalidIdentifier(
            name.to_string(),
            "length must be between 1 and 128 bytes",
        ));
    }
    let first_ok = matches!(bytes[0], b'a'..=b'z' | b'A'..=b'Z' | b'_');
    if !first_ok {
        return Err(LayoutError::InvalidIdentifier(
            name.to_string(),
            "must start with a letter or underscore",
        ));
    }
    if !bytes
        .iter()
        .all(|b| matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_'))
    {
        return Err(LayoutError::InvalidIdentifier(
            name.to_string(),
            "must contain only ASCII alphanumerics and underscores",
        ));
    }
    Ok(())
}

/// Maximum number of columns supported by one schema [spec §3].
pub const MAX_COLUMNS: usize = 64;

/// Identifies which typed parallel array (and position within it) a
/// non-PK column's values live in inside a [`crate::row::PayloadRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSlot {
    Int(usize),
    Float(usize),
    Str(usize),
    U128(usize),
}

/// An ordered, immutable column list with a designated primary key index.
///
/// Derives per-column byte offsets in an AoS layout (successive
/// alignment: string alignment 8, u128 alignment 16, everything else its
/// own size) and a fixed stride. The PK column itself is excluded from
/// the payload offsets/stride — it is stored separately (see
/// [`crate::row::PayloadRow`]).
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<Column>,
    pk_index: usize,
    /// Byte offset of each non-PK column within the payload stride.
    /// The entry at `pk_index` is unused (set to `usize::MAX` as a sentinel).
    column_offsets: Vec<usize>,
    /// Fixed stride of one payload row, aligned to the widest column.
    stride: usize,
    /// Per-column position within `PayloadRow`'s typed parallel arrays.
    /// The entry at `pk_index` is unused.
    payload_slots: Vec<Option<PayloadSlot>>,
    /// Number of non-PK columns of each primitive kind, in declaration order.
    int_count: usize,
    float_count: usize,
    str_count: usize,
    u128_count: usize,
}

impl TableSchema {
    /// Build a new schema, computing offsets and stride by successive
    /// alignment over the non-PK columns in declaration order.
    pub fn new(columns: Vec<Column>, pk_index: usize) -> Result<Arc<Self>, LayoutError> {
        if columns.len() > MAX_COLUMNS {
            return Err(LayoutError::TooManyColumns(columns.len()));
        }
        if pk_index >= columns.len() {
            return Err(LayoutError::InvalidPkIndex(pk_index, columns.len()));
        }
        for name in &columns {
            validate_identifier(&name.name)?;
        }
        for i in 0..columns.len() {
            for j in (i + 1)..columns.len() {
                if columns[i].name == columns[j].name {
                    return Err(LayoutError::DuplicateColumn(columns[i].name.clone()));
                }
            }
        }

        let mut offsets = vec![usize::MAX; columns.len()];
        let mut cursor = 0usize;
        let mut max_alignment = 1usize;
        let mut slots = vec![None; columns.len()];
        let (mut int_count, mut float_count, mut str_count, mut u128_count) = (0, 0, 0, 0);
        for (i, col) in columns.iter().enumerate() {
            if i == pk_index {
                continue;
            }
            cursor = align_up(cursor, col.field_type.alignment());
            offsets[i] = cursor;
            cursor += col.field_type.size();
            max_alignment = max_alignment.max(col.field_type.alignment());

            slots[i] = Some(if col.field_type.is_integer() {
                let slot = PayloadSlot::Int(int_count);
                int_count += 1;
                slot
            } else if col.field_type.is_float() {
                let slot = PayloadSlot::Float(float_count);
                float_count += 1;
                slot
            } else if col.field_type == FieldType::String {
                let slot = PayloadSlot::Str(str_count);
                str_count += 1;
                slot
            } else {
                let slot = PayloadSlot::U128(u128_count);
                u128_count += 1;
                slot
            });
        }
        let stride = align_up(cursor, max_alignment);

        Ok(Arc::new(TableSchema {
            columns,
            pk_index,
            column_offsets: offsets,
            stride,
            payload_slots: slots,
            int_count,
            float_count,
            str_count,
            u128_count,
        }))
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    pub fn pk_column(&self) -> &Column {
        &self.columns[self.pk_index]
    }

    /// True when the primary key is a u128 column (16-byte key on the wire).
    pub fn pk_is_u128(&self) -> bool {
        self.pk_column().field_type == FieldType::U128
    }

    /// Byte offset of `col_idx` within a packed payload row. Panics if
    /// `col_idx` is the PK column.
    pub fn column_offset(&self, col_idx: usize) -> usize {
        assert_ne!(col_idx, self.pk_index, "PK column has no payload offset");
        self.column_offsets[col_idx]
    }

    /// Fixed stride, in bytes, of one packed payload row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Non-PK columns in schema order, paired with their index.
    pub fn payload_columns(&self) -> impl Iterator<Item = (usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.pk_index)
    }

    /// Where column `col_idx`'s values live in a `PayloadRow`'s typed
    /// parallel arrays. Panics if `col_idx` is the PK column.
    pub fn payload_slot(&self, col_idx: usize) -> PayloadSlot {
        self.payload_slots[col_idx].expect("PK column has no payload slot")
    }

    /// Number of non-PK columns of each primitive kind: `(ints, floats, strings, u128s)`.
    pub fn slot_counts(&self) -> (usize, usize, usize, usize) {
        (self.int_count, self.float_count, self.str_count, self.u128_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn offsets_are_aligned() {
        let s = schema();
        // name (string, align 8) at 0, score (i64, align 8) at 16.
        assert_eq!(s.column_offset(1), 0);
        assert_eq!(s.column_offset(2), 16);
        assert_eq!(s.stride(), 24);
    }

    #[test]
    fn rejects_too_many_columns() {
        let cols: Vec<Column> = (0..65)
            .map(|i| Column::new(format!("c{i}"), FieldType::U64))
            .collect();
        assert!(TableSchema::new(cols, 0).is_err());
    }

    #[test]
    fn rejects_duplicate_columns() {
        let cols = vec![
            Column::new("id", FieldType::U64),
            Column::new("id", FieldType::I64),
        ];
        assert!(TableSchema::new(cols, 0).is_err());
    }

    #[test]
    fn rejects_bad_identifier() {
        let cols = vec![
            Column::new("1bad", FieldType::U64),
            Column::new("x", FieldType::I64),
        ];
        assert!(TableSchema::new(cols, 0).is_err());
    }

    #[test]
    fn u128_alignment() {
        let s = TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("a", FieldType::U8),
                Column::new("big", FieldType::U128),
            ],
            0,
        )
        .unwrap();
        assert_eq!(s.column_offset(1), 0);
        assert_eq!(s.column_offset(2), 16);
        assert_eq!(s.stride(), 32);
    }
}
