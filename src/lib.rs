//! # GnitzDB
//!
//! An incremental-view-maintenance database: a columnar Z-set storage
//! engine (write-ahead log, in-memory table, immutable shards, a
//! manifest-versioned LSM index) feeding a DBSP virtual machine (typed
//! registers, monomorphic instructions, operator kernels) through a
//! reactive executor that cascades deltas across a dependency graph and
//! broadcasts them to subscribers over a shared-memory IPC bus.
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|-----------------|
//! | [`gnitzdb_core`] | Arena allocation, table schemas, payload rows, Z-set batches |
//! | [`gnitzdb_storage`] | WAL, memtable, shards, manifest, compaction, ref-counted tables |
//! | [`gnitzdb_vm`] | Instructions, register file, the DBSP interpreter and its operator kernels |
//! | [`gnitzdb_executor`] | System catalog, program cache, dependency cascade, IPC server |
//!
//! Only [`gnitzdb_executor`]'s public surface is re-exported here; the
//! other crates are implementation layers a client reaches through it.

pub use gnitzdb_executor::*;
