//! The DBSP-style virtual machine: typed registers, monomorphic
//! instructions, operator kernels, and the pc-driven interpreter that
//! runs one view's program against one tick's delta [spec §4.10-§4.12].

pub mod error;
pub mod functions;
pub mod instruction;
pub mod interpreter;
pub mod kernels;
pub mod register;
pub mod rowutil;

pub use error::{Result, VmError};
pub use functions::{AggregateFn, FuncId, Function, FunctionRegistry, MapFn, PredicateFn};
pub use instruction::{Instruction, Opcode, YieldReason};
pub use interpreter::{Interpreter, Status};
pub use register::{DeltaRegister, Register, RegisterFile, TraceHandle, TraceRegister};
