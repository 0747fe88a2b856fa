//! `PayloadRow`: a row minus its primary-key column [spec §3 "PayloadRow"].
//!
//! Holds four parallel, compact arrays — `int` words (an `i64` bit
//! pattern covers every integer width and signedness), `float` words,
//! `string` slots, and `u128` (lo, hi) pairs — plus a null bitmap. The
//! tag of each non-PK column lives only in the schema; the row itself
//! carries no per-value type tag. Rows are built once via
//! [`PayloadRowBuilder`] and are immutable (and freely `Arc`-shared)
//! afterward.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::schema::{PayloadSlot, TableSchema};
use crate::strings::GermanString;

/// Builds a [`PayloadRow`] by appending exactly one value per non-PK
/// column, in schema order [spec §4.1].
pub struct PayloadRowBuilder {
    schema: Arc<TableSchema>,
    order: Vec<usize>,
    pos: usize,
    ints: Vec<i64>,
    floats: Vec<f64>,
    strings: Vec<GermanString>,
    u128s: Vec<(u64, u64)>,
    nulls: Vec<bool>,
}

impl PayloadRowBuilder {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        let order: Vec<usize> = schema.payload_columns().map(|(i, _)| i).collect();
        let n = schema.columns().len();
        let (n_int, n_float, n_str, n_u128) = schema.slot_counts();
        PayloadRowBuilder {
            schema,
            order,
            pos: 0,
            ints: Vec::with_capacity(n_int),
            floats: Vec::with_capacity(n_float),
            strings: Vec::with_capacity(n_str),
            u128s: Vec::with_capacity(n_u128),
            nulls: vec![false; n],
        }
    }

    fn advance(&mut self) -> usize {
        assert!(
            self.pos < self.order.len(),
            "PayloadRowBuilder: more appends than non-PK columns"
        );
        let col_idx = self.order[self.pos];
        self.pos += 1;
        col_idx
    }

    pub fn append_int(&mut self, v: i64) -> &mut Self {
        let col_idx = self.advance();
        debug_assert!(
            self.schema.columns()[col_idx].field_type.is_integer(),
            "append_int on non-integer column {}",
            self.schema.columns()[col_idx].name
        );
        self.ints.push(v);
        self
    }

    pub fn append_float(&mut self, v: f64) -> &mut Self {
        let col_idx = self.advance();
        debug_assert!(
            self.schema.columns()[col_idx].field_type.is_float(),
            "append_float on non-float column {}",
            self.schema.columns()[col_idx].name
        );
        self.floats.push(v);
        self
    }

    pub fn append_string(&mut self, v: &str) -> &mut Self {
        let col_idx = self.advance();
        debug_assert_eq!(
            self.schema.columns()[col_idx].field_type,
            crate::types::FieldType::String,
            "append_string on non-string column {}",
            self.schema.columns()[col_idx].name
        );
        self.strings.push(GermanString::new(v));
        self
    }

    pub fn append_u128(&mut self, lo: u64, hi: u64) -> &mut Self {
        let col_idx = self.advance();
        debug_assert_eq!(
            self.schema.columns()[col_idx].field_type,
            crate::types::FieldType::U128,
            "append_u128 on non-u128 column {}",
            self.schema.columns()[col_idx].name
        );
        self.u128s.push((lo, hi));
        self
    }

    /// Append a null for the expected column `col`. `col` must equal the
    /// next column in schema order; this is a redundant sanity check the
    /// caller can use since, unlike the typed appends, there is no value
    /// to infer the slot from.
    pub fn append_null(&mut self, col: usize) -> &mut Self {
        let col_idx = self.advance();
        debug_assert_eq!(col, col_idx, "append_null column mismatch");
        debug_assert!(
            self.schema.columns()[col_idx].nullable,
            "append_null on non-nullable column {}",
            self.schema.columns()[col_idx].name
        );
        match self.schema.payload_slot(col_idx) {
            PayloadSlot::Int(_) => self.ints.push(0),
            PayloadSlot::Float(_) => self.floats.push(0.0),
            PayloadSlot::Str(_) => self.strings.push(GermanString::new("")),
            PayloadSlot::U128(_) => self.u128s.push((0, 0)),
        }
        self.nulls[col_idx] = true;
        self
    }

    /// Finish the row. Panics (debug and release) if fewer than all
    /// non-PK columns were appended — a partial row is a builder misuse,
    /// not a recoverable error [spec §4.1 "No partial rows..."].
    pub fn finish(self) -> PayloadRow {
        assert_eq!(
            self.pos,
            self.order.len(),
            "PayloadRowBuilder::finish called with {} of {} columns appended",
            self.pos,
            self.order.len()
        );
        PayloadRow {
            schema: self.schema,
            ints: self.ints.into(),
            floats: self.floats.into(),
            strings: self.strings.into(),
            u128s: self.u128s.into(),
            nulls: self.nulls.into(),
        }
    }
}

/// An immutable, schema-typed row minus its primary key.
#[derive(Debug, Clone)]
pub struct PayloadRow {
    schema: Arc<TableSchema>,
    ints: Arc<[i64]>,
    floats: Arc<[f64]>,
    strings: Arc<[GermanString]>,
    u128s: Arc<[(u64, u64)]>,
    nulls: Arc<[bool]>,
}

impl PayloadRow {
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn is_null(&self, col: usize) -> bool {
        self.nulls[col]
    }

    /// Raw `i64` bit pattern for an integer column, sign-extended per
    /// its declared width.
    pub fn get_int_signed(&self, col: usize) -> i64 {
        match self.schema.payload_slot(col) {
            PayloadSlot::Int(i) => self.ints[i],
            other => panic!("column {col} is not an integer slot ({other:?})"),
        }
    }

    /// Same bits as [`Self::get_int_signed`], reinterpreted unsigned —
    /// used by the unsigned comparator [spec §4.2].
    pub fn get_int_unsigned(&self, col: usize) -> u64 {
        self.get_int_signed(col) as u64
    }

    pub fn get_float(&self, col: usize) -> f64 {
        match self.schema.payload_slot(col) {
            PayloadSlot::Float(i) => self.floats[i],
            other => panic!("column {col} is not a float slot ({other:?})"),
        }
    }

    pub fn get_u128(&self, col: usize) -> u128 {
        match self.schema.payload_slot(col) {
            PayloadSlot::U128(i) => {
                let (lo, hi) = self.u128s[i];
                ((hi as u128) << 64) | lo as u128
            }
            other => panic!("column {col} is not a u128 slot ({other:?})"),
        }
    }

    /// Low/high 64-bit halves of a u128 column, as stored.
    pub fn get_u128_parts(&self, col: usize) -> (u64, u64) {
        match self.schema.payload_slot(col) {
            PayloadSlot::U128(i) => self.u128s[i],
            other => panic!("column {col} is not a u128 slot ({other:?})"),
        }
    }

    pub fn get_str(&self, col: usize) -> &str {
        match self.schema.payload_slot(col) {
            PayloadSlot::Str(i) => self.strings[i].as_str(),
            other => panic!("column {col} is not a string slot ({other:?})"),
        }
    }

    fn get_german_string(&self, col: usize) -> &GermanString {
        match self.schema.payload_slot(col) {
            PayloadSlot::Str(i) => &self.strings[i],
            other => panic!("column {col} is not a string slot ({other:?})"),
        }
    }

    /// Total order over non-PK columns, in schema order: unsigned
    /// comparison for integer columns, `(hi, lo)` order for u128
    /// columns, prefix-short-circuited comparison for strings, and
    /// `total_cmp` for floats [spec §4.2].
    pub fn cmp_payload(&self, other: &PayloadRow) -> Ordering {
        debug_assert!(Arc::ptr_eq(&self.schema, &other.schema) || self.schema == other.schema);
        for (col, column) in self.schema.payload_columns() {
            let ord = if column.field_type.is_integer() {
                self.get_int_unsigned(col).cmp(&other.get_int_unsigned(col))
            } else if column.field_type.is_float() {
                self.get_float(col).total_cmp(&other.get_float(col))
            } else if column.field_type == crate::types::FieldType::String {
                self.get_german_string(col).cmp(other.get_german_string(col))
            } else {
                let (lo_a, hi_a) = self.get_u128_parts(col);
                let (lo_b, hi_b) = other.get_u128_parts(col);
                (hi_a, lo_a).cmp(&(hi_b, lo_b))
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for PayloadRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_payload(other) == Ordering::Equal
    }
}
impl Eq for PayloadRow {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::types::FieldType;

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
    fn build_and_read_row() {
        let schema = schema();
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_string("hello");
        b.append_int(-7);
        let row = b.finish();
        assert_eq!(row.get_str(1), "hello");
        assert_eq!(row.get_int_signed(2), -7);
        assert!(!row.is_null(1));
    }

    #[test]
    #[should_panic]
    fn finish_requires_all_columns() {
        let schema = schema();
        let mut b = PayloadRowBuilder::new(schema);
        b.append_string("only one");
        let _ = b.finish();
    }

    #[test]
    fn unsigned_ordering_of_negative_bit_pattern() {
        // Scenario C [spec §8]: u64 PK schema, payload column u64.
        let schema = TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("v", FieldType::U64),
            ],
            0,
        )
        .unwrap();
        let mut zero = PayloadRowBuilder::new(schema.clone());
        zero.append_int(0);
        let zero = zero.finish();

        let mut max = PayloadRowBuilder::new(schema);
        max.append_int(-1); // bit pattern of u64::MAX
        let max = max.finish();

        assert_eq!(zero.cmp_payload(&max), Ordering::Less);
    }

    #[test]
    fn u128_hi_word_distinguishes_equal_lo() {
        let schema = TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("v", FieldType::U128),
            ],
            0,
        )
        .unwrap();
        let mut a = PayloadRowBuilder::new(schema.clone());
        a.append_u128(0xDEAD, 0xBEEF);
        let a = a.finish();

        let mut b = PayloadRowBuilder::new(schema);
        b.append_u128(0xDEAD, 0xBEEF + 1);
        let b = b.finish();

        assert_ne!(a, b);
        assert_eq!(a.cmp_payload(&b), Ordering::Less);
    }
}
