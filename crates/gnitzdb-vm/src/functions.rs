//! Opaque function references an instruction carries by id: predicates,
//! row mappers, and aggregates [spec §4.11 "optional function ids"].
//!
//! Compiling a view definition down to function bodies is the catalog's
//! job, not this crate's — the VM only defines the closure shapes and a
//! registry to resolve an id to one at run time.

use std::sync::Arc;

use gnitzdb_core::PayloadRow;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Numeric id an [`crate::instruction::Instruction`] carries in place of
/// an inline closure.
pub type FuncId = u32;

/// `true` keeps an entry, `false` drops it; weight is unaffected either way.
pub type PredicateFn = Arc<dyn Fn(&PayloadRow) -> bool + Send + Sync>;

/// Builds one fresh output row from one input row.
pub type MapFn = Arc<dyn Fn(&PayloadRow) -> PayloadRow + Send + Sync>;

/// Folds a group's weighted rows — and, for non-linear aggregates, the
/// group's prior state — into one new state row [spec §4.12 "reduce"].
pub type AggregateFn =
    Arc<dyn Fn(&[(i64, Arc<PayloadRow>)], Option<&PayloadRow>) -> PayloadRow + Send + Sync>;

#[derive(Clone)]
pub enum Function {
    Predicate(PredicateFn),
    Map(MapFn),
    Aggregate(AggregateFn),
}

/// Id-keyed lookup table for the closures instructions reference.
/// Populated once when a program is built; the interpreter only reads it.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<FxHashMap<FuncId, Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    pub fn register(&self, id: FuncId, f: Function) {
        self.functions.write().insert(id, f);
    }

    pub fn predicate(&self, id: FuncId) -> Option<PredicateFn> {
        match self.functions.read().get(&id)? {
            Function::Predicate(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn map(&self, id: FuncId) -> Option<MapFn> {
        match self.functions.read().get(&id)? {
            Function::Map(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn aggregate(&self, id: FuncId) -> Option<AggregateFn> {
        match self.functions.read().get(&id)? {
            Function::Aggregate(f) => Some(f.clone()),
            _ => None,
        }
    }
}
