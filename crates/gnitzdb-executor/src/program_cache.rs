//! The program cache: compiles `_instructions` rows into cached
//! [`ExecutablePlan`]s keyed by `program_id` (a view's id), with
//! pre-bound trace cursors so the cascade never re-opens a cursor on
//! the hot path [spec §4.14].
//!
//! Grounded on `gnitz/catalog/program_cache.py`'s `ProgramCache`: same
//! lazy-load/cache/invalidate shape. The original decodes instruction
//! rows through a handful of positionally-overloaded integer columns
//! (`acc.get_int(13)` means different things for different opcodes);
//! this crate's `_instructions` schema names every field instead, so
//! decoding an instruction row is one uniform path rather than one
//! branch per opcode's column layout.

use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema};
use gnitzdb_vm::{Instruction, Opcode, Register, RegisterFile, TraceHandle, YieldReason};
use parking_lot::Mutex;

use crate::catalog::{SystemCatalog, SYS_TABLE_INSTRUCTIONS, SYS_TABLE_VIEW_DEPS};
use crate::error::Result;

/// An immutable, pre-compiled execution unit for one view: the
/// monomorphic instruction stream plus the register file its
/// instructions were compiled against (trace registers already hold
/// live cursors onto their backing relation).
pub struct ExecutablePlan {
    pub program: Vec<Instruction>,
    pub regs: Mutex<RegisterFile>,
    pub out_schema: Arc<TableSchema>,
}

/// Caches [`ExecutablePlan`]s by view id, reloading from
/// `_instructions`/`_view_deps` on a miss.
pub struct ProgramCache {
    catalog: Arc<SystemCatalog>,
    cache: dashmap::DashMap<u64, Arc<ExecutablePlan>>,
}

impl ProgramCache {
    pub fn new(catalog: Arc<SystemCatalog>) -> Self {
        ProgramCache { catalog, cache: dashmap::DashMap::new() }
    }

    pub fn get(&self, program_id: u64) -> Result<Option<Arc<ExecutablePlan>>> {
        if let Some(plan) = self.cache.get(&program_id) {
            return Ok(Some(plan.clone()));
        }
        let Some(plan) = self.load_program(program_id)? else {
            return Ok(None);
        };
        let plan = Arc::new(plan);
        self.cache.insert(program_id, plan.clone());
        Ok(Some(plan))
    }

    pub fn invalidate(&self, program_id: u64) {
        self.cache.remove(&program_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Find the schema of the primary upstream source feeding register
    /// 0: the first `_view_deps` row for this view with a concrete
    /// base table wins, falling back to a derived view dependency, and
    /// finally to `fallback` if the graph has nothing to say.
    fn resolve_primary_input_schema(&self, program_id: u64, fallback: Arc<TableSchema>) -> Result<Arc<TableSchema>> {
        if !self.catalog.has_id(SYS_TABLE_VIEW_DEPS) {
            return Ok(fallback);
        }
        let deps = self.catalog.get_or_err(SYS_TABLE_VIEW_DEPS)?;
        let mut cursor = deps.create_cursor()?;
        let mut result = fallback;
        while cursor.is_valid() {
            if cursor.weight().unwrap_or(0) > 0 {
                if let Some(row) = cursor.get_accessor() {
                    // `_view_deps` columns: 0=dep_id (PK), 1=view_id,
                    // 2=dep_view_id, 3=dep_table_id.
                    let view_id = row.get_int_unsigned(1);
                    if view_id == program_id {
                        let dep_view_id = row.get_int_unsigned(2);
                        let dep_table_id = row.get_int_unsigned(3);
                        let source_id = if dep_table_id > 0 { dep_table_id } else { dep_view_id };
                        if source_id > 0 {
                            if let Some(handle) = self.catalog.get(source_id) {
                                result = handle.schema().clone();
                                break;
                            }
                        }
                    }
                }
            }
            cursor.advance_cursor()?;
        }
        cursor.close()?;
        Ok(result)
    }

    fn load_program(&self, program_id: u64) -> Result<Option<ExecutablePlan>> {
        if !self.catalog.has_id(SYS_TABLE_INSTRUCTIONS) {
            return Ok(None);
        }
        let Some(out_handle) = self.catalog.get(program_id) else {
            return Ok(None);
        };
        let out_schema = out_handle.schema().clone();
        let in_schema = self.resolve_primary_input_schema(program_id, out_schema.clone())?;

        let instr_table = self.catalog.get_or_err(SYS_TABLE_INSTRUCTIONS)?;
        let mut cursor = instr_table.create_cursor()?;
        cursor.seek((0, program_id))?;

        let mut program = Vec::new();
        let mut regs = RegisterFile::new(16);

        while cursor.is_valid() {
            let Some((_, hi)) = cursor.key() else { break };
            if hi != program_id {
                break;
            }
            if cursor.weight().unwrap_or(0) > 0 {
                if let Some(row) = cursor.get_accessor() {
                    if let Some(instr) = self.decode_instruction(row, &mut regs, &in_schema, &out_schema)? {
                        program.push(instr);
                    }
                }
            }
            cursor.advance_cursor()?;
        }
        cursor.close()?;

        if program.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExecutablePlan { program, regs: Mutex::new(regs), out_schema }))
    }

    fn decode_instruction(
        &self,
        row: &PayloadRow,
        regs: &mut RegisterFile,
        in_schema: &Arc<TableSchema>,
        out_schema: &Arc<TableSchema>,
    ) -> Result<Option<Instruction>> {
        // `_instructions` columns: 0=instr_id (PK), 1=view_id, 2=seq,
        // 3=opcode, 4..=13 the operand fields below.
        let opcode_code = row.get_int_unsigned(3) as u8;
        let Some(opcode) = Opcode::from_code(opcode_code) else {
            return Ok(None);
        };
        let reg_a = opt_u16(row, 4);
        let reg_b = opt_u16(row, 5);
        let reg_c = opt_u16(row, 6);
        let reg_out = opt_u16(row, 7);
        let func_id = opt_u32(row, 8);
        let group_by_cols = opt_str(row, 9).map(|s| parse_group_by(&s));
        let chunk_limit = opt_usize(row, 10);
        let jump_target = opt_usize(row, 11);
        let yield_reason = opt_u16(row, 12).map(yield_reason_from_code);
        let tid = opt_u64(row, 13);

        let tid_schema = |cat: &SystemCatalog, fallback: &Arc<TableSchema>| -> Arc<TableSchema> {
            tid.and_then(|t| cat.get(t)).map(|h| h.schema().clone()).unwrap_or_else(|| fallback.clone())
        };
        let tid_trace = |cat: &SystemCatalog| -> Option<TraceHandle> { tid.and_then(|t| cat.get(t)) };

        match opcode {
            Opcode::Filter | Opcode::Negate | Opcode::Delay => {
                let sch = tid_schema(&self.catalog, in_schema);
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, sch.clone());
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, sch);
                }
            }
            Opcode::Map => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, tid_schema(&self.catalog, out_schema));
                }
            }
            Opcode::Union => {
                let sch = tid_schema(&self.catalog, in_schema);
                for id in [reg_a, reg_b, reg_out].into_iter().flatten() {
                    ensure_delta(regs, id, sch.clone());
                }
            }
            Opcode::Distinct => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let (Some(id), Some(handle)) = (reg_b, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, in_schema.clone());
                }
            }
            Opcode::JoinDeltaTrace => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let (Some(id), Some(handle)) = (reg_b, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, out_schema.clone());
                }
            }
            Opcode::JoinDeltaDelta => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let Some(id) = reg_b {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, tid_schema(&self.catalog, out_schema));
                }
            }
            Opcode::Reduce => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, in_schema.clone());
                }
                if let (Some(id), Some(handle)) = (reg_b, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let (Some(id), Some(handle)) = (reg_c, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, out_schema.clone());
                }
            }
            Opcode::Integrate => {
                if let Some(id) = reg_a {
                    ensure_delta(regs, id, tid_schema(&self.catalog, in_schema));
                }
                if let (Some(id), Some(handle)) = (reg_b, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
            }
            Opcode::ScanTrace => {
                if let (Some(id), Some(handle)) = (reg_a, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let Some(id) = reg_out {
                    ensure_delta(regs, id, tid_schema(&self.catalog, out_schema));
                }
            }
            Opcode::SeekTrace => {
                if let (Some(id), Some(handle)) = (reg_a, tid_trace(&self.catalog)) {
                    ensure_trace(regs, id, handle)?;
                }
                if let Some(id) = reg_b {
                    ensure_delta(regs, id, in_schema.clone());
                }
            }
            Opcode::Yield | Opcode::Jump | Opcode::ClearDeltas | Opcode::Halt => {}
        }

        let mut instr = if opcode == Opcode::Delay {
            Instruction::delay(reg_a.unwrap_or(0), reg_out.unwrap_or(0))
        } else {
            Instruction::new(opcode)
        };
        if let Some(id) = reg_a {
            instr = instr.reg_a(id);
        }
        if let Some(id) = reg_b {
            instr = instr.reg_b(id);
        }
        if let Some(id) = reg_c {
            instr = instr.reg_c(id);
        }
        if let Some(id) = reg_out {
            instr = instr.reg_out(id);
        }
        if let Some(f) = func_id {
            instr = instr.func(f);
        }
        if let Some(cols) = group_by_cols {
            instr = instr.group_by(cols);
        }
        if let Some(n) = chunk_limit {
            instr = instr.chunk_limit(n);
        }
        if let Some(t) = jump_target {
            instr = instr.jump_target(t);
        }
        if let Some(r) = yield_reason {
            instr = instr.with_yield_reason(r);
        }
        Ok(Some(instr))
    }
}

fn ensure_delta(regs: &mut RegisterFile, id: u16, schema: Arc<TableSchema>) {
    if regs.delta(id).is_err() {
        let _ = regs.bind(id, Register::Delta(gnitzdb_vm::DeltaRegister::new(schema)));
    }
}

fn ensure_trace(regs: &mut RegisterFile, id: u16, handle: TraceHandle) -> Result<()> {
    if regs.trace(id).is_err() {
        let _ = regs.bind(id, Register::Trace(gnitzdb_vm::TraceRegister::new(handle)));
    }
    Ok(())
}

fn opt_u16(row: &PayloadRow, col: usize) -> Option<u16> {
    if row.is_null(col) {
        None
    } else {
        Some(row.get_int_unsigned(col) as u16)
    }
}

fn opt_u64(row: &PayloadRow, col: usize) -> Option<u64> {
    if row.is_null(col) {
        None
    } else {
        Some(row.get_int_unsigned(col))
    }
}

fn opt_u32(row: &PayloadRow, col: usize) -> Option<u32> {
    if row.is_null(col) {
        None
    } else {
        Some(row.get_int_unsigned(col) as u32)
    }
}

fn opt_usize(row: &PayloadRow, col: usize) -> Option<usize> {
    if row.is_null(col) {
        None
    } else {
        Some(row.get_int_unsigned(col) as usize)
    }
}

fn opt_str(row: &PayloadRow, col: usize) -> Option<String> {
    if row.is_null(col) {
        None
    } else {
        Some(row.get_str(col).to_string())
    }
}

fn parse_group_by(s: &str) -> Vec<usize> {
    s.split(',').filter(|p| !p.is_empty()).filter_map(|p| p.parse().ok()).collect()
}

fn yield_reason_from_code(code: u16) -> YieldReason {
    match code {
        1 => YieldReason::BufferFull,
        2 => YieldReason::RowLimit,
        _ => YieldReason::User,
    }
}
