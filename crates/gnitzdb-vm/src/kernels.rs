//! Operator kernels [spec §4.12]: pure functions over batches (plus, for
//! the trace-reading operators, a cursor). None of these catch their own
//! errors — a failure propagates straight up to the interpreter, which
//! halts the program rather than letting a kernel paper over it
//! [spec §7].

use std::cmp::Ordering;
use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema, ZSetBatch};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::functions::{AggregateFn, MapFn, PredicateFn};
use crate::register::{TraceHandle, TraceRegister};
use crate::rowutil::{concat_rows, group_key};

/// `filter(in, out, pred)`: copy entries whose predicate holds, weight unchanged.
pub fn filter(input: &ZSetBatch, pred: &PredicateFn, out: &mut ZSetBatch) {
    out.clear();
    for (pk, w, row) in input.iter() {
        if pred(row) {
            out.append(pk.0, pk.1, w, row.clone());
        }
    }
}

/// `map(in, out, fn)`: build a fresh row per input entry via `fn`,
/// preserving `(pk, weight)`.
pub fn map_rows(input: &ZSetBatch, f: &MapFn, out: &mut ZSetBatch) {
    out.clear();
    for (pk, w, row) in input.iter() {
        out.append(pk.0, pk.1, w, Arc::new(f(row)));
    }
}

/// `negate(in, out)`: weight -> -weight.
pub fn negate(input: &ZSetBatch, out: &mut ZSetBatch) {
    out.clear();
    for (pk, w, row) in input.iter() {
        out.append(pk.0, pk.1, -w, row.clone());
    }
}

/// `union(a, b, out)`: concatenate, then consolidate so opposite weights
/// on the same `(pk, payload)` annihilate [spec §5.4 "Ghost Property"].
pub fn union(a: &ZSetBatch, b: &ZSetBatch, out: &mut ZSetBatch) {
    let mut merged = a.clone();
    merged.extend(b.clone());
    merged.consolidate();
    *out = merged;
}

fn sign(w: i64) -> i64 {
    match w.cmp(&0) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// `distinct(in, hist_trace, out)`: for each input entry with delta
/// weight `d` and the trace's current net weight `t` at the same
/// `(pk, payload)`, emit `sign(t + d) - sign(t)`. Read-only against the
/// trace — a later `INTEGRATE` instruction folds `in` into it
/// [spec §4.12 "distinct"].
pub fn distinct(input: &ZSetBatch, hist_trace: &TraceHandle, out: &mut ZSetBatch) -> Result<()> {
    out.clear();
    for (pk, d, row) in input.iter() {
        let t = hist_trace.find_exact(pk, row)?;
        let delta_sign = sign(t + d) - sign(t);
        if delta_sign != 0 {
            out.append(pk.0, pk.1, delta_sign, row.clone());
        }
    }
    Ok(())
}

/// `join_delta_trace(delta, trace, out)`: for each entry of `delta`,
/// seek `trace` to that key and emit one joined row per trace entry
/// sharing it, weight `w_delta * w_trace` [spec §4.12 "join_delta_trace"].
pub fn join_delta_trace(
    delta: &ZSetBatch,
    trace: &mut TraceRegister,
    out_schema: &Arc<TableSchema>,
    out: &mut ZSetBatch,
) -> Result<()> {
    out.clear();
    let delta_cols = delta.schema().payload_columns().count();
    for (pk, w_delta, d_row) in delta.iter() {
        trace.seek(pk)?;
        loop {
            let cursor = trace.cursor()?;
            if !cursor.is_valid() || cursor.key() != Some(pk) {
                break;
            }
            let w_trace = cursor.weight().unwrap_or(0);
            let t_row = cursor.get_accessor().cloned();
            cursor.advance_cursor()?;
            if let Some(t_row) = t_row {
                let joined = concat_rows(out_schema, d_row, delta_cols, &t_row);
                out.append(pk.0, pk.1, w_delta * w_trace, Arc::new(joined));
            }
        }
    }
    Ok(())
}

fn group_end(batch: &ZSetBatch, start: usize, pk: (u64, u64)) -> usize {
    let mut k = start;
    while k < batch.len() && batch.pk(k) == pk {
        k += 1;
    }
    k
}

/// `join_delta_delta(a, b, out)`: sort both by PK, sort-merge, Cartesian
/// product per matching PK group, DBSP bilinear weight `w_a * w_b`
/// [spec §4.12 "join_delta_delta"].
pub fn join_delta_delta(a: &ZSetBatch, b: &ZSetBatch, out_schema: &Arc<TableSchema>, out: &mut ZSetBatch) {
    out.clear();
    let mut a_sorted = a.clone();
    a_sorted.sort();
    let mut b_sorted = b.clone();
    b_sorted.sort();
    let a_cols = a.schema().payload_columns().count();

    let (mut i, mut j) = (0usize, 0usize);
    while i < a_sorted.len() && j < b_sorted.len() {
        let (a_lo, a_hi) = a_sorted.pk(i);
        let (b_lo, b_hi) = b_sorted.pk(j);
        match (a_hi, a_lo).cmp(&(b_hi, b_lo)) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                let pk = (a_lo, a_hi);
                let i_end = group_end(&a_sorted, i, pk);
                let j_end = group_end(&b_sorted, j, pk);
                for ai in i..i_end {
                    for bj in j..j_end {
                        let w = a_sorted.weight(ai) * b_sorted.weight(bj);
                        let joined = concat_rows(out_schema, a_sorted.row(ai), a_cols, b_sorted.row(bj));
                        out.append(pk.0, pk.1, w, Arc::new(joined));
                    }
                }
                i = i_end;
                j = j_end;
            }
        }
    }
}

/// Current single-row group state at `pk`, if the trace holds one.
/// `reduce`'s state traces hold at most one live entry per group key.
fn group_state(trace: &mut TraceRegister, pk: (u64, u64)) -> Result<Option<Arc<PayloadRow>>> {
    trace.seek(pk)?;
    let cursor = trace.cursor()?;
    if cursor.is_valid() && cursor.key() == Some(pk) {
        Ok(cursor.get_accessor().cloned())
    } else {
        Ok(None)
    }
}

/// `reduce(in, trace_in, trace_out, out, group_cols, agg)`: group `in`
/// by `group_cols`; for each group, compute one new state row via `agg`
/// (given `trace_in`'s prior state for non-linear aggregates), emit a
/// retract-old/insert-new pair into `out`, and write the new state into
/// `trace_out` [spec §4.12 "reduce"].
pub fn reduce(
    input: &ZSetBatch,
    trace_in: &mut TraceRegister,
    trace_out: &TraceHandle,
    group_cols: &[usize],
    agg: &AggregateFn,
    out: &mut ZSetBatch,
) -> Result<()> {
    out.clear();
    let mut groups: FxHashMap<Vec<String>, ((u64, u64), Vec<(i64, Arc<PayloadRow>)>)> = FxHashMap::default();
    for (pk, w, row) in input.iter() {
        let key = group_key(row, group_cols);
        groups.entry(key).or_insert_with(|| (pk, Vec::new())).1.push((w, row.clone()));
    }

    let mut state_delta = ZSetBatch::new(trace_out.schema().clone());
    for (pk, weighted_rows) in groups.into_values() {
        let old = group_state(trace_in, pk)?;
        let new_row = Arc::new(agg(&weighted_rows, old.as_deref()));
        if let Some(old_row) = old {
            out.append(pk.0, pk.1, -1, old_row.clone());
            state_delta.append(pk.0, pk.1, -1, old_row);
        }
        out.append(pk.0, pk.1, 1, new_row.clone());
        state_delta.append(pk.0, pk.1, 1, new_row);
    }
    trace_out.ingest(&state_delta)?;
    Ok(())
}

/// `delay(in, out)`: `out_t = in_{t-1}` — the buffer is owned by the
/// `DELAY` instruction itself so it survives across cascade ticks of
/// the same cached plan [spec §4.12 "delay"].
pub fn delay(input: &ZSetBatch, out: &mut ZSetBatch, buffer: &Mutex<Option<ZSetBatch>>) {
    let mut guard = buffer.lock();
    let previous = guard.take().unwrap_or_else(|| ZSetBatch::new(out.schema().clone()));
    *out = previous;
    *guard = Some(input.clone());
}

/// `integrate(in, target_table)`: sink — ingest `in` into the table
/// `target` refers to [spec §4.12 "integrate"].
pub fn integrate(input: &ZSetBatch, target: &TraceHandle) -> Result<()> {
    target.ingest(input)?;
    Ok(())
}

/// `scan_trace(trace, out, chunk_limit)`: read up to `chunk_limit`
/// entries from `trace` into `out`, advancing the cursor. Returns `true`
/// if the trace still has more entries after this chunk (the interpreter
/// should `YIELD(BufferFull)`), `false` if it's now exhausted
/// [spec §4.12 "scan_trace"].
pub fn scan_trace(trace: &mut TraceRegister, out: &mut ZSetBatch, chunk_limit: usize) -> Result<bool> {
    out.clear();
    let mut read = 0;
    while read < chunk_limit {
        let cursor = trace.cursor()?;
        if !cursor.is_valid() {
            return Ok(false);
        }
        let pk = cursor.key().unwrap();
        let w = cursor.weight().unwrap();
        let row = cursor.get_accessor().unwrap().clone();
        out.append(pk.0, pk.1, w, row);
        cursor.advance_cursor()?;
        read += 1;
    }
    Ok(trace.cursor()?.is_valid())
}

/// `seek_trace(trace, key)`: reposition `trace`'s cursor to the first
/// key `>= key` [spec §4.12 "seek_trace"].
pub fn seek_trace(trace: &mut TraceRegister, key: (u64, u64)) -> Result<()> {
    trace.seek(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnitzdb_core::{Column, PayloadRowBuilder};
    use gnitzdb_storage::EphemeralTable;
    use tempfile::tempdir;

    fn left_schema() -> Arc<TableSchema> {
        TableSchema::new(vec![Column::new("id", gnitzdb_core::FieldType::U64), Column::new("score", gnitzdb_core::FieldType::I64)], 0).unwrap()
    }

    fn right_schema() -> Arc<TableSchema> {
        TableSchema::new(vec![Column::new("id", gnitzdb_core::FieldType::U64), Column::new("name", gnitzdb_core::FieldType::String)], 0).unwrap()
    }

    fn joined_schema() -> Arc<TableSchema> {
        TableSchema::new(
            vec![
                Column::new("id", gnitzdb_core::FieldType::U64),
                Column::new("score", gnitzdb_core::FieldType::I64),
                Column::new("name", gnitzdb_core::FieldType::String),
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
    fn filter_keeps_matching_weight() {
        let schema = left_schema();
        let mut input = ZSetBatch::new(schema.clone());
        input.append(1, 0, 1, row(&schema, 10));
        input.append(2, 0, 1, row(&schema, -10));
        let pred: PredicateFn = Arc::new(|r: &PayloadRow| r.get_int_signed(1) > 0);
        let mut out = ZSetBatch::new(schema);
        filter(&input, &pred, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out.pk(0), (1, 0));
    }

    #[test]
    fn negate_flips_weight_only() {
        let schema = left_schema();
        let mut input = ZSetBatch::new(schema.clone());
        input.append(1, 0, 3, row(&schema, 10));
        let mut out = ZSetBatch::new(schema);
        negate(&input, &mut out);
        assert_eq!(out.weight(0), -3);
    }

    #[test]
    fn union_annihilates_opposite_weights() {
        let schema = left_schema();
        let r = row(&schema, 1);
        let mut a = ZSetBatch::new(schema.clone());
        a.append(1, 0, 1, r.clone());
        let mut b = ZSetBatch::new(schema.clone());
        b.append(1, 0, -1, r);
        let mut out = ZSetBatch::new(schema);
        union(&a, &b, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn join_delta_delta_cartesian_per_matching_pk() {
        let left = left_schema();
        let right = right_schema();
        let joined = joined_schema();

        let mut a = ZSetBatch::new(left.clone());
        a.append(1, 0, 2, row(&left, 100));

        let mut b = ZSetBatch::new(right.clone());
        let mut br = PayloadRowBuilder::new(right.clone());
        br.append_string("alice");
        b.append(1, 0, 3, Arc::new(br.finish()));

        let mut out = ZSetBatch::new(joined.clone());
        join_delta_delta(&a, &b, &joined, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out.weight(0), 6);
        assert_eq!(out.row(0).get_int_signed(1), 100);
        assert_eq!(out.row(0).get_str(2), "alice");
    }

    #[test]
    fn distinct_emits_sign_change_only() {
        let schema = left_schema();
        let r = row(&schema, 1);
        let dir = tempdir().unwrap();
        let table = Arc::new(EphemeralTable::new(schema.clone(), 1, dir.path()));
        let handle = TraceHandle::Ephemeral(table.clone());

        // Trace starts empty (t=0); delta brings weight to 1: sign goes 0 -> 1.
        let mut input = ZSetBatch::new(schema.clone());
        input.append(1, 0, 1, r.clone());
        let mut out = ZSetBatch::new(schema.clone());
        distinct(&input, &handle, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.weight(0), 1);

        // Now integrate that delta into the trace, and present the same
        // delta again: t=1, d=1, sign(2)-sign(1) = 0, nothing should emit.
        table.upsert_batch(&input);
        distinct(&input, &handle, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
