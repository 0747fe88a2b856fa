//! Typed VM registers and the fixed-size file that holds them
//! [spec §4.10].
//!
//! A [`DeltaRegister`] owns a batch of in-flight changes. A
//! [`TraceRegister`] owns a cursor into a table's full accumulated
//! history — either a durable [`PersistentTable`] or an unlogged
//! [`EphemeralTable`] — positioned by `SEEK_TRACE`/`SCAN_TRACE` or
//! reseekable at will for joins.

use std::sync::Arc;

use gnitzdb_core::{PayloadRow, TableSchema, ZSetBatch};
use gnitzdb_storage::{EphemeralTable, PersistentTable, UnifiedCursor};

use crate::error::{Result, VmError};

/// A batch of pending changes flowing between two operators this tick.
/// `clear()` resets it to empty but keeps whatever capacity its
/// parallel arrays already hold, so a hot register doesn't reallocate
/// every cascade [spec §4.10 "DeltaRegister"].
pub struct DeltaRegister {
    schema: Arc<TableSchema>,
    batch: ZSetBatch,
}

impl DeltaRegister {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        DeltaRegister {
            batch: ZSetBatch::new(schema.clone()),
            schema,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn batch(&self) -> &ZSetBatch {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut ZSetBatch {
        &mut self.batch
    }

    /// Replace the register's batch outright, e.g. to alias register 0
    /// onto an externally-owned delta for the tick [spec §4.15 step (b)].
    pub fn set_batch(&mut self, batch: ZSetBatch) {
        self.batch = batch;
    }

    pub fn clear(&mut self) {
        self.batch.clear();
    }

    pub fn is_delta(&self) -> bool {
        true
    }
}

/// Which kind of table backs a [`TraceRegister`].
#[derive(Clone)]
pub enum TraceHandle {
    Persistent(Arc<PersistentTable>),
    Ephemeral(Arc<EphemeralTable>),
}

impl TraceHandle {
    pub fn schema(&self) -> &Arc<TableSchema> {
        match self {
            TraceHandle::Persistent(t) => t.schema(),
            TraceHandle::Ephemeral(t) => t.schema(),
        }
    }

    pub fn create_cursor(&self) -> gnitzdb_storage::Result<UnifiedCursor> {
        match self {
            TraceHandle::Persistent(t) => t.create_cursor(),
            TraceHandle::Ephemeral(t) => t.create_cursor(),
        }
    }

    /// Current net weight for an exact `(pk, payload)` pair — the
    /// trace's running sum over everything integrated into it so far.
    pub fn find_exact(&self, pk: (u64, u64), row: &PayloadRow) -> gnitzdb_storage::Result<i64> {
        match self {
            TraceHandle::Persistent(t) => t.get_weight(pk, row),
            TraceHandle::Ephemeral(t) => Ok(t.find_exact(pk, row)),
        }
    }

    /// Sink a delta into the table this handle targets, the `integrate`
    /// kernel's only job [spec §4.12 "integrate"].
    pub fn ingest(&self, batch: &ZSetBatch) -> gnitzdb_storage::Result<()> {
        match self {
            TraceHandle::Persistent(t) => t.ingest_batch(batch),
            TraceHandle::Ephemeral(t) => {
                t.upsert_batch(batch);
                Ok(())
            }
        }
    }
}

/// A register bound to a table's full history rather than one tick's
/// delta [spec §4.10 "TraceRegister"].
pub struct TraceRegister {
    handle: TraceHandle,
    cursor: Option<UnifiedCursor>,
}

impl TraceRegister {
    pub fn new(handle: TraceHandle) -> Self {
        TraceRegister {
            handle,
            cursor: None,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        self.handle.schema()
    }

    pub fn handle(&self) -> &TraceHandle {
        &self.handle
    }

    pub fn is_trace(&self) -> bool {
        true
    }

    /// The bound cursor, opening it lazily on first use.
    pub fn cursor(&mut self) -> Result<&mut UnifiedCursor> {
        if self.cursor.is_none() {
            self.cursor = Some(self.handle.create_cursor()?);
        }
        Ok(self.cursor.as_mut().unwrap())
    }

    /// `SEEK_TRACE`: reposition to the first key `>= pk` [spec §4.12 "seek_trace"].
    pub fn seek(&mut self, pk: (u64, u64)) -> Result<()> {
        self.cursor()?.seek(pk)?;
        Ok(())
    }

    /// Drop and reopen the cursor from the table's current start —
    /// used before a fresh `SCAN_TRACE` pass over the whole trace.
    pub fn rewind(&mut self) -> Result<()> {
        self.cursor = Some(self.handle.create_cursor()?);
        Ok(())
    }
}

/// One bound slot in a [`RegisterFile`].
pub enum Register {
    Delta(DeltaRegister),
    Trace(TraceRegister),
}

impl Register {
    pub fn as_delta(&self) -> Option<&DeltaRegister> {
        match self {
            Register::Delta(d) => Some(d),
            Register::Trace(_) => None,
        }
    }

    pub fn as_delta_mut(&mut self) -> Option<&mut DeltaRegister> {
        match self {
            Register::Delta(d) => Some(d),
            Register::Trace(_) => None,
        }
    }

    pub fn as_trace(&self) -> Option<&TraceRegister> {
        match self {
            Register::Trace(t) => Some(t),
            Register::Delta(_) => None,
        }
    }

    pub fn as_trace_mut(&mut self) -> Option<&mut TraceRegister> {
        match self {
            Register::Trace(t) => Some(t),
            Register::Delta(_) => None,
        }
    }
}

/// Fixed-size array of optional registers indexed by id
/// [spec §4.10 "RegisterFile"]. Register 0 is the cascade's primary
/// input by convention [spec §4.14, §4.15]; register 1 is the
/// canonical output.
pub struct RegisterFile {
    registers: Vec<Option<Register>>,
}

impl RegisterFile {
    pub fn new(size: usize) -> Self {
        RegisterFile {
            registers: (0..size).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn bind(&mut self, id: u16, reg: Register) -> Result<()> {
        let slot = self
            .registers
            .get_mut(id as usize)
            .ok_or(VmError::RegisterOutOfRange(id, self.registers.len()))?;
        *slot = Some(reg);
        Ok(())
    }

    pub fn unbind(&mut self, id: u16) -> Result<()> {
        let slot = self
            .registers
            .get_mut(id as usize)
            .ok_or(VmError::RegisterOutOfRange(id, self.registers.len()))?;
        *slot = None;
        Ok(())
    }

    pub fn get(&self, id: u16) -> Result<&Register> {
        self.registers
            .get(id as usize)
            .ok_or(VmError::RegisterOutOfRange(id, self.registers.len()))?
            .as_ref()
            .ok_or(VmError::UnboundRegister(id))
    }

    pub fn get_mut(&mut self, id: u16) -> Result<&mut Register> {
        let len = self.registers.len();
        self.registers
            .get_mut(id as usize)
            .ok_or(VmError::RegisterOutOfRange(id, len))?
            .as_mut()
            .ok_or(VmError::UnboundRegister(id))
    }

    pub fn delta(&self, id: u16) -> Result<&DeltaRegister> {
        self.get(id)?.as_delta().ok_or(VmError::NotADelta(id))
    }

    pub fn delta_mut(&mut self, id: u16) -> Result<&mut DeltaRegister> {
        self.get_mut(id)?.as_delta_mut().ok_or(VmError::NotADelta(id))
    }

    pub fn trace(&self, id: u16) -> Result<&TraceRegister> {
        self.get(id)?.as_trace().ok_or(VmError::NotATrace(id))
    }

    pub fn trace_mut(&mut self, id: u16) -> Result<&mut TraceRegister> {
        self.get_mut(id)?.as_trace_mut().ok_or(VmError::NotATrace(id))
    }

    /// Borrow two distinct delta registers at once — one read-only input,
    /// one mutable output — via a slice split on the underlying array.
    /// Every binary/unary kernel that reads one delta register and
    /// writes another goes through this rather than cloning a batch.
    pub fn delta_pair_mut(&mut self, in_id: u16, out_id: u16) -> Result<(&DeltaRegister, &mut DeltaRegister)> {
        let len = self.registers.len();
        if in_id == out_id {
            return Err(VmError::RegisterOutOfRange(in_id, len));
        }
        let (in_idx, out_idx) = (in_id as usize, out_id as usize);
        if in_idx >= len {
            return Err(VmError::RegisterOutOfRange(in_id, len));
        }
        if out_idx >= len {
            return Err(VmError::RegisterOutOfRange(out_id, len));
        }

        let (in_slot, out_slot) = if in_idx < out_idx {
            let (left, right) = self.registers.split_at_mut(out_idx);
            (left[in_idx].as_ref(), right[0].as_mut())
        } else {
            let (left, right) = self.registers.split_at_mut(in_idx);
            (right[0].as_ref(), left[out_idx].as_mut())
        };

        let in_reg = in_slot.ok_or(VmError::UnboundRegister(in_id))?;
        let out_reg = out_slot.ok_or(VmError::UnboundRegister(out_id))?;
        let in_delta = in_reg.as_delta().ok_or(VmError::NotADelta(in_id))?;
        let out_delta = out_reg.as_delta_mut().ok_or(VmError::NotADelta(out_id))?;
        Ok((in_delta, out_delta))
    }

    /// `CLEAR_DELTAS`: reset every delta register except `keep` (register
    /// 0 during a cascade) [spec §4.12 "clear_deltas", §4.15 step (b)].
    pub fn clear_deltas_except(&mut self, keep: u16) {
        for (i, slot) in self.registers.iter_mut().enumerate() {
            if i as u16 == keep {
                continue;
            }
            if let Some(Register::Delta(d)) = slot {
                d.clear();
            }
        }
    }
}
