//! Row-shaping helpers shared by the join kernels.
//!
//! A joined output schema is, by convention, the left input's non-PK
//! columns followed by the right input's non-PK columns, in declaration
//! order — the same convention the catalog uses when it builds a join
//! view's output schema from its two sources. `concat_rows` walks that
//! convention column-by-column rather than assuming the two schemas'
//! widths line up with the output's any other way.

use std::sync::Arc;

use gnitzdb_core::{FieldType, PayloadRow, PayloadRowBuilder, TableSchema};

fn nth_payload_col(schema: &TableSchema, n: usize) -> usize {
    schema
        .payload_columns()
        .nth(n)
        .expect("join output schema wider than its sources")
        .0
}

fn append_value(builder: &mut PayloadRowBuilder, src: &PayloadRow, src_col: usize, out_col: usize) {
    if src.is_null(src_col) {
        builder.append_null(out_col);
        return;
    }
    let field_type = src.schema().columns()[src_col].field_type;
    if field_type.is_integer() {
        builder.append_int(src.get_int_signed(src_col));
    } else if field_type.is_float() {
        builder.append_float(src.get_float(src_col));
    } else if field_type == FieldType::String {
        builder.append_string(src.get_str(src_col));
    } else {
        let (lo, hi) = src.get_u128_parts(src_col);
        builder.append_u128(lo, hi);
    }
}

/// Build one joined row under `out_schema` from `left`'s first
/// `left_payload_cols` payload columns followed by `right`'s payload
/// columns [spec §4.12 "join_delta_trace", "join_delta_delta"].
pub fn concat_rows(
    out_schema: &Arc<TableSchema>,
    left: &PayloadRow,
    left_payload_cols: usize,
    right: &PayloadRow,
) -> PayloadRow {
    let mut builder = PayloadRowBuilder::new(out_schema.clone());
    for (seq, (out_col, _)) in out_schema.payload_columns().enumerate() {
        if seq < left_payload_cols {
            let src_col = nth_payload_col(left.schema(), seq);
            append_value(&mut builder, left, src_col, out_col);
        } else {
            let src_col = nth_payload_col(right.schema(), seq - left_payload_cols);
            append_value(&mut builder, right, src_col, out_col);
        }
    }
    builder.finish()
}

/// Render a row's value at `col` as a comparable token for grouping —
/// used by `reduce` to bucket entries by `group_by_cols` without
/// requiring a dedicated key type per column-type combination.
pub fn render_column(row: &PayloadRow, col: usize) -> String {
    if row.is_null(col) {
        return "\u{0}".to_string();
    }
    let field_type = row.schema().columns()[col].field_type;
    if field_type.is_integer() {
        row.get_int_signed(col).to_string()
    } else if field_type.is_float() {
        row.get_float(col).to_string()
    } else if field_type == FieldType::String {
        row.get_str(col).to_string()
    } else {
        let (lo, hi) = row.get_u128_parts(col);
        format!("{hi}:{lo}")
    }
}

pub fn group_key(row: &PayloadRow, cols: &[usize]) -> Vec<String> {
    cols.iter().map(|&c| render_column(row, c)).collect()
}
