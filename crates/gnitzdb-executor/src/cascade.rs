//! The reactive cascade: when a base table (or view output) changes,
//! walk `_view_deps` to find downstream views, run each cached plan
//! against the delta, and push any non-empty output further down the
//! graph [spec §4.15].
//!
//! Grounded on `gnitz/server/executor.py`'s `_evaluate_dag`: a FIFO
//! queue of `(target_id, delta, depth, owns_delta)`, a depth cutoff for
//! runaway cycles, and the same register-0-alias / register-1-output
//! convention. `DELAY` is the only supported recursion primitive —
//! nothing here special-cases cycles beyond the depth cutoff.

use std::collections::VecDeque;
use std::sync::Arc;

use gnitzdb_core::ZSetBatch;
use gnitzdb_vm::{FunctionRegistry, Interpreter, Register, Status};

use crate::catalog::{SystemCatalog, SYS_TABLE_VIEW_DEPS};
use crate::error::Result;
use crate::program_cache::ProgramCache;

/// Caps cascade depth against cyclic or runaway dependency graphs.
/// `DELAY` is the supported way to express genuine recursion; anything
/// that still hasn't settled by this depth is dropped.
pub const MAX_CASCADE_DEPTH: u32 = 64;

struct CascadeItem {
    target_id: u64,
    delta: ZSetBatch,
    depth: u32,
}

/// Runs the dependency-graph cascade for one ingested (or broadcast)
/// delta. Holds no per-connection state — that lives in the server's
/// connection table — only the catalog and program cache needed to
/// evaluate views.
pub struct CascadeExecutor {
    catalog: Arc<SystemCatalog>,
    programs: Arc<ProgramCache>,
    functions: Arc<FunctionRegistry>,
}

/// One view's output delta, ready to broadcast to its subscribers.
pub struct CascadeOutput {
    pub view_id: u64,
    pub delta: ZSetBatch,
}

impl CascadeExecutor {
    pub fn new(catalog: Arc<SystemCatalog>, programs: Arc<ProgramCache>, functions: Arc<FunctionRegistry>) -> Self {
        CascadeExecutor { catalog, programs, functions }
    }

    /// Evaluate the full cascade starting from `initial_target_id`
    /// having just received `initial_delta`. Returns every view output
    /// produced along the way, in the order they were computed, so the
    /// caller can broadcast each to its subscribers.
    pub fn evaluate(&self, initial_target_id: u64, initial_delta: ZSetBatch) -> Result<Vec<CascadeOutput>> {
        let mut queue = VecDeque::new();
        queue.push_back(CascadeItem { target_id: initial_target_id, delta: initial_delta, depth: 0 });

        let mut outputs = Vec::new();

        while let Some(item) = queue.pop_front() {
            if item.depth > MAX_CASCADE_DEPTH {
                tracing::warn!(target = item.target_id, "cascade depth cutoff reached, dropping delta");
                continue;
            }

            for view_id in self.dependent_views(item.target_id)? {
                let Some(plan) = self.programs.get(view_id)? else { continue };
                let mut regs = plan.regs.lock();

                // 1. Alias register 0 to this tick's delta.
                let had_reg0 = regs.get(0).is_ok();
                if had_reg0 {
                    if let Ok(reg0) = regs.delta_mut(0) {
                        reg0.set_batch(item.delta.clone());
                    }
                }

                // 2. Clear every other delta register for a clean tick.
                regs.clear_deltas_except(0);

                // 3. Run the program to completion (or to its first YIELD).
                let mut interp = Interpreter::new(&plan.program, &mut regs, &self.functions);
                match interp.run() {
                    Status::Error(msg) => {
                        tracing::warn!(view = view_id, error = %msg, "view evaluation failed, skipping output");
                    }
                    _ => {
                        // 4. Register 1 is the canonical output register.
                        if let Ok(out_reg) = regs.delta(1) {
                            if !out_reg.batch().is_empty() {
                                let cloned = out_reg.batch().clone();
                                queue.push_back(CascadeItem {
                                    target_id: view_id,
                                    delta: cloned.clone(),
                                    depth: item.depth + 1,
                                });
                                outputs.push(CascadeOutput { view_id, delta: cloned });
                            }
                        }
                    }
                }

                // 5. Sever the register-0 alias so the next tick's step 1
                // rebinds before any stale read can occur.
                if had_reg0 {
                    if let Ok(Register::Delta(reg0)) = regs.get_mut(0) {
                        reg0.clear();
                    }
                }
            }
        }

        Ok(outputs)
    }

    /// Views depending on `target_id`, per `_view_deps`
    /// (`dep_view_id == target_id || dep_table_id == target_id`).
    fn dependent_views(&self, target_id: u64) -> Result<Vec<u64>> {
        if !self.catalog.has_id(SYS_TABLE_VIEW_DEPS) {
            return Ok(Vec::new());
        }
        let deps = self.catalog.get_or_err(SYS_TABLE_VIEW_DEPS)?;
        let mut cursor = deps.create_cursor()?;
        let mut found = Vec::new();
        while cursor.is_valid() {
            if cursor.weight().unwrap_or(0) > 0 {
                if let Some(row) = cursor.get_accessor() {
                    // 0=dep_id (PK), 1=view_id, 2=dep_view_id, 3=dep_table_id.
                    let view_id = row.get_int_unsigned(1);
                    let dep_view_id = row.get_int_unsigned(2);
                    let dep_table_id = row.get_int_unsigned(3);
                    if (dep_view_id == target_id || dep_table_id == target_id) && !found.contains(&view_id) {
                        found.push(view_id);
                    }
                }
            }
            cursor.advance_cursor()?;
        }
        cursor.close()?;
        Ok(found)
    }
}
