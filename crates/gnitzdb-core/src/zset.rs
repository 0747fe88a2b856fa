//! `ZSetBatch`: a finite multiset of `(primary key, payload row)` pairs
//! with integer weights [spec §3 "Z-set", §4.2].
//!
//! Three parallel arrays — primary keys, weights, and rows — so sorting
//! and consolidation touch only what they need to. Rows are `Arc`-shared;
//! consolidating or reordering a batch never deep-clones a row.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::row::PayloadRow;
use crate::schema::TableSchema;

/// A batch of weighted rows sharing one schema.
///
/// `Ghost Property` [spec §5.4]: after [`Self::consolidate`], no two
/// entries compare equal (same primary key, same payload) and no entry
/// carries a weight of zero — equal-and-opposite weights annihilate
/// each other entirely rather than persisting as a zero-weight ghost.
#[derive(Debug, Clone)]
pub struct ZSetBatch {
    schema: Arc<TableSchema>,
    pks: Vec<(u64, u64)>,
    weights: Vec<i64>,
    rows: Vec<Arc<PayloadRow>>,
}

impl ZSetBatch {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        ZSetBatch {
            schema,
            pks: Vec::new(),
            weights: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn with_capacity(schema: Arc<TableSchema>, capacity: usize) -> Self {
        ZSetBatch {
            schema,
            pks: Vec::with_capacity(capacity),
            weights: Vec::with_capacity(capacity),
            rows: Vec::with_capacity(capacity),
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.pks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pks.is_empty()
    }

    /// Append one `(pk, weight, row)` entry. `pk_hi` is `0` for non-u128
    /// primary keys.
    pub fn append(&mut self, pk_lo: u64, pk_hi: u64, weight: i64, row: Arc<PayloadRow>) {
        self.pks.push((pk_lo, pk_hi));
        self.weights.push(weight);
        self.rows.push(row);
    }

    pub fn pk(&self, i: usize) -> (u64, u64) {
        self.pks[i]
    }

    pub fn weight(&self, i: usize) -> i64 {
        self.weights[i]
    }

    pub fn row(&self, i: usize) -> &Arc<PayloadRow> {
        &self.rows[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = ((u64, u64), i64, &Arc<PayloadRow>)> {
        (0..self.len()).map(move |i| (self.pks[i], self.weights[i], &self.rows[i]))
    }

    /// Move every entry of `other` into `self`, leaving `other` empty.
    pub fn extend(&mut self, mut other: ZSetBatch) {
        self.pks.append(&mut other.pks);
        self.weights.append(&mut other.weights);
        self.rows.append(&mut other.rows);
    }

    pub fn clear(&mut self) {
        self.pks.clear();
        self.weights.clear();
        self.rows.clear();
    }

    /// Total order over entries: unsigned `(hi, lo)` primary key first,
    /// then [`PayloadRow::cmp_payload`] to break ties between distinct
    /// rows sharing a primary key (e.g. during a transient, pre-consolidate
    /// delta).
    fn cmp_entries(&self, i: usize, j: usize) -> Ordering {
        let (lo_a, hi_a) = self.pks[i];
        let (lo_b, hi_b) = self.pks[j];
        match (hi_a, lo_a).cmp(&(hi_b, lo_b)) {
            Ordering::Equal => self.rows[i].cmp_payload(&self.rows[j]),
            ord => ord,
        }
    }

    /// Sort all entries in place by `(pk, payload)`, preserving the
    /// parallel-array correspondence between pk/weight/row.
    pub fn sort(&mut self) {
        let mut perm: Vec<usize> = (0..self.len()).collect();
        perm.sort_by(|&i, &j| self.cmp_entries(i, j));

        let pks = perm.iter().map(|&i| self.pks[i]).collect();
        let weights = perm.iter().map(|&i| self.weights[i]).collect();
        let rows = perm.iter().map(|&i| self.rows[i].clone()).collect();
        self.pks = pks;
        self.weights = weights;
        self.rows = rows;
    }

    /// Sort, then merge runs of identical `(pk, payload)` entries by
    /// summing weights, dropping any run whose summed weight is zero
    /// [spec §5.4 "Ghost Property"].
    ///
    /// Idempotent: consolidating an already-consolidated batch is a
    /// no-op, since every remaining run has length one.
    pub fn consolidate(&mut self) {
        self.sort();
        let n = self.len();
        let mut new_pks = Vec::with_capacity(n);
        let mut new_weights = Vec::with_capacity(n);
        let mut new_rows = Vec::with_capacity(n);

        let mut i = 0;
        while i < n {
            let mut j = i + 1;
            let mut total = self.weights[i];
            while j < n && self.cmp_entries(i, j) == Ordering::Equal {
                total += self.weights[j];
                j += 1;
            }
            if total != 0 {
                new_pks.push(self.pks[i]);
                new_weights.push(total);
                new_rows.push(self.rows[i].clone());
            }
            i = j;
        }

        self.pks = new_pks;
        self.weights = new_weights;
        self.rows = new_rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::PayloadRowBuilder;
    use crate::schema::Column;
    use crate::types::FieldType;

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(
            vec![
                Column::new("id", FieldType::U64),
                Column::new("score", FieldType::I64),
            ],
            0,
        )
        .unwrap()
    }

    fn row(schema: &Arc<TableSchema>, score: i64) -> Arc<PayloadRow> {
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_int(score);
        Arc::new(b.finish())
    }

    #[test]
    fn ghost_property_annihilates_opposite_weights() {
        let schema = schema();
        let mut batch = ZSetBatch::new(schema.clone());
        let r = row(&schema, 42);
        batch.append(1, 0, 1, r.clone());
        batch.append(1, 0, -1, r);
        batch.consolidate();
        assert!(batch.is_empty(), "net-zero entry must be annihilated, not kept as weight 0");
    }

    #[test]
    fn consolidate_sums_matching_entries() {
        let schema = schema();
        let mut batch = ZSetBatch::new(schema.clone());
        let r = row(&schema, 42);
        batch.append(1, 0, 2, r.clone());
        batch.append(1, 0, 3, r);
        batch.consolidate();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.weight(0), 5);
    }

    #[test]
    fn consolidate_is_idempotent() {
        let schema = schema();
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(2, 0, 1, row(&schema, 1));
        batch.append(1, 0, 1, row(&schema, 2));
        batch.append(1, 0, -4, row(&schema, 3));
        batch.consolidate();
        let once = batch.clone();
        batch.consolidate();
        assert_eq!(once.pks, batch.pks);
        assert_eq!(once.weights, batch.weights);
    }

    #[test]
    fn distinct_rows_sharing_a_pk_do_not_merge() {
        let schema = schema();
        let mut batch = ZSetBatch::new(schema.clone());
        batch.append(1, 0, 1, row(&schema, 10));
        batch.append(1, 0, 1, row(&schema, 20));
        batch.consolidate();
        assert_eq!(batch.len(), 2);
    }
}
