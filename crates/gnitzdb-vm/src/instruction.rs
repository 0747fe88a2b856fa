//! Instructions: a stable numeric opcode plus whichever register ids,
//! function id, grouping columns, and operator-specific parameters that
//! opcode needs [spec §4.11].

use std::sync::Arc;

use gnitzdb_core::ZSetBatch;
use parking_lot::Mutex;

/// Stable numeric opcode, 1..N — never renumbered once assigned, since
/// `_instructions` rows on disk encode these values directly [spec §4.11].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Filter = 1,
    Map = 2,
    Negate = 3,
    Union = 4,
    Distinct = 5,
    JoinDeltaTrace = 6,
    JoinDeltaDelta = 7,
    Reduce = 8,
    Delay = 9,
    Integrate = 10,
    ScanTrace = 11,
    SeekTrace = 12,
    Yield = 13,
    Jump = 14,
    ClearDeltas = 15,
    Halt = 16,
}

impl Opcode {
    pub fn from_code(code: u8) -> Option<Opcode> {
        Some(match code {
            1 => Opcode::Filter,
            2 => Opcode::Map,
            3 => Opcode::Negate,
            4 => Opcode::Union,
            5 => Opcode::Distinct,
            6 => Opcode::JoinDeltaTrace,
            7 => Opcode::JoinDeltaDelta,
            8 => Opcode::Reduce,
            9 => Opcode::Delay,
            10 => Opcode::Integrate,
            11 => Opcode::ScanTrace,
            12 => Opcode::SeekTrace,
            13 => Opcode::Yield,
            14 => Opcode::Jump,
            15 => Opcode::ClearDeltas,
            16 => Opcode::Halt,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Why an interpreter run suspended at a `YIELD`, carried in the plan's
/// status slot and mirrored in the IPC reply header
/// [spec §6 "Yield reasons"].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum YieldReason {
    None = 0,
    BufferFull = 1,
    RowLimit = 2,
    User = 3,
}

/// One instruction. Fields unused by `opcode` sit at their default;
/// `Instruction::new` plus the builder methods below keep call sites
/// readable without a dozen positional arguments.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub reg_a: Option<u16>,
    pub reg_b: Option<u16>,
    /// A third operand register, needed only by `REDUCE` (`trace_out`,
    /// distinct from `reg_b`'s `trace_in`).
    pub reg_c: Option<u16>,
    pub reg_out: Option<u16>,
    pub func_id: Option<u32>,
    pub group_by_cols: Option<Vec<usize>>,
    pub chunk_limit: Option<usize>,
    pub jump_target: Option<usize>,
    pub yield_reason: Option<YieldReason>,
    /// Cross-tick storage for `DELAY`: the previous tick's output,
    /// owned by this instruction slot so it survives from one cascade
    /// invocation of the cached plan to the next [spec §4.12 "delay"].
    pub delay_buffer: Option<Arc<Mutex<Option<ZSetBatch>>>>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            reg_a: None,
            reg_b: None,
            reg_c: None,
            reg_out: None,
            func_id: None,
            group_by_cols: None,
            chunk_limit: None,
            jump_target: None,
            yield_reason: None,
            delay_buffer: None,
        }
    }

    /// Build a `DELAY` instruction with its own fresh cross-tick buffer.
    pub fn delay(reg_a: u16, reg_out: u16) -> Self {
        Instruction::new(Opcode::Delay)
            .reg_a(reg_a)
            .reg_out(reg_out)
            .with_delay_buffer(Arc::new(Mutex::new(None)))
    }

    pub fn with_delay_buffer(mut self, buffer: Arc<Mutex<Option<ZSetBatch>>>) -> Self {
        self.delay_buffer = Some(buffer);
        self
    }

    pub fn reg_a(mut self, id: u16) -> Self {
        self.reg_a = Some(id);
        self
    }

    pub fn reg_b(mut self, id: u16) -> Self {
        self.reg_b = Some(id);
        self
    }

    pub fn reg_c(mut self, id: u16) -> Self {
        self.reg_c = Some(id);
        self
    }

    pub fn reg_out(mut self, id: u16) -> Self {
        self.reg_out = Some(id);
        self
    }

    pub fn func(mut self, id: u32) -> Self {
        self.func_id = Some(id);
        self
    }

    pub fn group_by(mut self, cols: Vec<usize>) -> Self {
        self.group_by_cols = Some(cols);
        self
    }

    pub fn chunk_limit(mut self, n: usize) -> Self {
        self.chunk_limit = Some(n);
        self
    }

    pub fn jump_target(mut self, pc: usize) -> Self {
        self.jump_target = Some(pc);
        self
    }

    pub fn with_yield_reason(mut self, reason: YieldReason) -> Self {
        self.yield_reason = Some(reason);
        self
    }
}
