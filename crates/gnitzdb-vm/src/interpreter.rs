//! The interpreter: a pc-driven dispatch loop over one program and one
//! register file [spec §4.11-§4.15].
//!
//! Kernels never catch their own errors, so every `Err` bubbling up here
//! halts the program and records the message rather than unwinding or
//! retrying [spec §7 "propagation policy"]. The interpreter yields only
//! at explicit `YIELD` instructions; everything between two yields runs
//! to completion [spec §5].

use gnitzdb_core::ZSetBatch;

use crate::error::{Result, VmError};
use crate::functions::FunctionRegistry;
use crate::instruction::{Instruction, Opcode, YieldReason};
use crate::kernels;
use crate::register::RegisterFile;

/// Where the interpreter currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Running,
    Yielded(YieldReason),
    Halted,
    Error(String),
}

pub struct Interpreter<'a> {
    program: &'a [Instruction],
    regs: &'a mut RegisterFile,
    functions: &'a FunctionRegistry,
    pc: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a [Instruction], regs: &'a mut RegisterFile, functions: &'a FunctionRegistry) -> Self {
        Interpreter { program, regs, functions, pc: 0 }
    }

    /// Resume execution from wherever `pc` currently sits — `0` on a
    /// fresh plan, or just past the last `YIELD` on a resumed one.
    pub fn run(&mut self) -> Status {
        loop {
            if self.pc >= self.program.len() {
                return Status::Halted;
            }
            match self.step() {
                Ok(Some(status)) => return status,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, pc = self.pc, "instruction failed, halting");
                    return Status::Error(e.to_string());
                }
            }
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    fn step(&mut self) -> Result<Option<Status>> {
        let instr = self.program[self.pc].clone();
        match instr.opcode {
            Opcode::Filter => {
                let (a, out) = (self.req_reg_a(&instr)?, self.req_reg_out(&instr)?);
                let func_id = instr.func_id.ok_or(VmError::MissingFunction)?;
                let pred = self.functions.predicate(func_id).ok_or(VmError::UnknownFunction(func_id))?;
                let (input, output) = self.regs.delta_pair_mut(a, out)?;
                kernels::filter(input.batch(), &pred, output.batch_mut());
            }
            Opcode::Map => {
                let (a, out) = (self.req_reg_a(&instr)?, self.req_reg_out(&instr)?);
                let func_id = instr.func_id.ok_or(VmError::MissingFunction)?;
                let f = self.functions.map(func_id).ok_or(VmError::UnknownFunction(func_id))?;
                let (input, output) = self.regs.delta_pair_mut(a, out)?;
                kernels::map_rows(input.batch(), &f, output.batch_mut());
            }
            Opcode::Negate => {
                let (a, out) = (self.req_reg_a(&instr)?, self.req_reg_out(&instr)?);
                let (input, output) = self.regs.delta_pair_mut(a, out)?;
                kernels::negate(input.batch(), output.batch_mut());
            }
            Opcode::Union => {
                let (a, b, out) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?, self.req_reg_out(&instr)?);
                let a_batch = self.regs.delta(a)?.batch().clone();
                let (b_reg, out_reg) = self.regs.delta_pair_mut(b, out)?;
                kernels::union(&a_batch, b_reg.batch(), out_reg.batch_mut());
            }
            Opcode::Distinct => {
                let (a, b, out) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?, self.req_reg_out(&instr)?);
                let hist_trace = self.regs.trace(b)?.handle().clone();
                let (input, output) = self.regs.delta_pair_mut(a, out)?;
                kernels::distinct(input.batch(), &hist_trace, output.batch_mut())?;
            }
            Opcode::JoinDeltaTrace => {
                let (a, b, out) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?, self.req_reg_out(&instr)?);
                let out_schema = self.regs.delta(out)?.schema().clone();
                let delta_batch = self.regs.delta(a)?.batch().clone();
                let trace = self.regs.trace_mut(b)?;
                let mut local = ZSetBatch::new(out_schema.clone());
                kernels::join_delta_trace(&delta_batch, trace, &out_schema, &mut local)?;
                self.regs.delta_mut(out)?.set_batch(local);
            }
            Opcode::JoinDeltaDelta => {
                let (a, b, out) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?, self.req_reg_out(&instr)?);
                let a_batch = self.regs.delta(a)?.batch().clone();
                let (b_reg, out_reg) = self.regs.delta_pair_mut(b, out)?;
                let out_schema = out_reg.schema().clone();
                kernels::join_delta_delta(&a_batch, b_reg.batch(), &out_schema, out_reg.batch_mut());
            }
            Opcode::Reduce => {
                let (a, b, out) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?, self.req_reg_out(&instr)?);
                let c = instr.reg_c.ok_or(VmError::MissingOperand)?;
                let group_cols = instr.group_by_cols.clone().ok_or(VmError::MissingOperand)?;
                let func_id = instr.func_id.ok_or(VmError::MissingFunction)?;
                let agg = self.functions.aggregate(func_id).ok_or(VmError::UnknownFunction(func_id))?;

                let trace_out_handle = self.regs.trace(c)?.handle().clone();
                let input_batch = self.regs.delta(a)?.batch().clone();
                let out_schema = self.regs.delta(out)?.schema().clone();
                let trace_in = self.regs.trace_mut(b)?;
                let mut local = ZSetBatch::new(out_schema.clone());
                kernels::reduce(&input_batch, trace_in, &trace_out_handle, &group_cols, &agg, &mut local)?;
                self.regs.delta_mut(out)?.set_batch(local);
            }
            Opcode::Delay => {
                let (a, out) = (self.req_reg_a(&instr)?, self.req_reg_out(&instr)?);
                let buffer = instr.delay_buffer.as_ref().ok_or(VmError::MissingOperand)?;
                let (input, output) = self.regs.delta_pair_mut(a, out)?;
                kernels::delay(input.batch(), output.batch_mut(), buffer);
            }
            Opcode::Integrate => {
                let (a, b) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?);
                let target = self.regs.trace(b)?.handle().clone();
                let input = self.regs.delta(a)?;
                kernels::integrate(input.batch(), &target)?;
            }
            Opcode::ScanTrace => {
                let (a, out) = (self.req_reg_a(&instr)?, self.req_reg_out(&instr)?);
                let chunk_limit = instr.chunk_limit.unwrap_or(usize::MAX);
                let out_schema = self.regs.delta(out)?.schema().clone();
                let trace = self.regs.trace_mut(a)?;
                let mut local = ZSetBatch::new(out_schema.clone());
                let more = kernels::scan_trace(trace, &mut local, chunk_limit)?;
                self.regs.delta_mut(out)?.set_batch(local);
                if more {
                    self.pc += 1;
                    return Ok(Some(Status::Yielded(YieldReason::BufferFull)));
                }
            }
            Opcode::SeekTrace => {
                let (a, b) = (self.req_reg_a(&instr)?, self.req_reg_b(&instr)?);
                let key_batch = self.regs.delta(b)?.batch();
                let pk = if key_batch.is_empty() { None } else { Some(key_batch.pk(0)) };
                if let Some(pk) = pk {
                    let trace = self.regs.trace_mut(a)?;
                    kernels::seek_trace(trace, pk)?;
                }
            }
            Opcode::ClearDeltas => {
                self.regs.clear_deltas_except(0);
            }
            Opcode::Yield => {
                let reason = instr.yield_reason.unwrap_or(YieldReason::User);
                self.pc += 1;
                return Ok(Some(Status::Yielded(reason)));
            }
            Opcode::Jump => {
                let target = instr.jump_target.ok_or(VmError::MissingOperand)?;
                if target > self.program.len() {
                    return Err(VmError::BadJump(target, self.program.len()));
                }
                self.pc = target;
                return Ok(None);
            }
            Opcode::Halt => {
                self.pc += 1;
                return Ok(Some(Status::Halted));
            }
        }
        self.pc += 1;
        Ok(None)
    }

    fn req_reg_a(&self, instr: &Instruction) -> Result<u16> {
        instr.reg_a.ok_or(VmError::MissingOperand)
    }

    fn req_reg_b(&self, instr: &Instruction) -> Result<u16> {
        instr.reg_b.ok_or(VmError::MissingOperand)
    }

    fn req_reg_out(&self, instr: &Instruction) -> Result<u16> {
        instr.reg_out.ok_or(VmError::MissingOperand)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gnitzdb_core::{Column, FieldType, PayloadRowBuilder, TableSchema};

    use super::*;
    use crate::functions::Function;
    use crate::register::{DeltaRegister, Register};

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(
            vec![Column::new("id", FieldType::U64), Column::new("score", FieldType::I64)],
            0,
        )
        .unwrap()
    }

    fn row(schema: &Arc<TableSchema>, score: i64) -> Arc<gnitzdb_core::PayloadRow> {
        let mut b = PayloadRowBuilder::new(schema.clone());
        b.append_int(score);
        Arc::new(b.finish())
    }

    #[test]
    fn filter_then_halt() {
        let schema = schema();
        let functions = FunctionRegistry::new();
        functions.register(1, Function::Predicate(Arc::new(|row: &gnitzdb_core::PayloadRow| row.get_int_signed(1) > 0)));

        let mut regs = RegisterFile::new(2);
        let mut input = DeltaRegister::new(schema.clone());
        input.batch_mut().append(1, 0, 1, row(&schema, 5));
        input.batch_mut().append(2, 0, 1, row(&schema, -5));
        regs.bind(0, Register::Delta(input)).unwrap();
        regs.bind(1, Register::Delta(DeltaRegister::new(schema.clone()))).unwrap();

        let program = vec![
            Instruction::new(Opcode::Filter).reg_a(0).reg_out(1).func(1),
            Instruction::new(Opcode::Halt),
        ];

        let mut interp = Interpreter::new(&program, &mut regs, &functions);
        let status = interp.run();
        assert_eq!(status, Status::Halted);
        assert_eq!(regs.delta(1).unwrap().batch().len(), 1);
        assert_eq!(regs.delta(1).unwrap().batch().pk(0), (1, 0));
    }

    #[test]
    fn yield_suspends_and_resumes() {
        let schema = schema();
        let functions = FunctionRegistry::new();
        let mut regs = RegisterFile::new(1);
        regs.bind(0, Register::Delta(DeltaRegister::new(schema))).unwrap();

        let program = vec![
            Instruction::new(Opcode::Yield).with_yield_reason(YieldReason::User),
            Instruction::new(Opcode::Halt),
        ];

        let mut interp = Interpreter::new(&program, &mut regs, &functions);
        assert_eq!(interp.run(), Status::Yielded(YieldReason::User));
        assert_eq!(interp.pc(), 1);
        assert_eq!(interp.run(), Status::Halted);
    }
}
