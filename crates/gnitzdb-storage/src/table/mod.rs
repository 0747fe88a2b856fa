//! Table implementations: durable ([`PersistentTable`], spec §4.9) and
//! in-memory ([`EphemeralTable`], spec §2 layering table "L3
//! EphemeralTable").

pub mod ephemeral;
pub mod persistent;

pub use ephemeral::EphemeralTable;
pub use persistent::PersistentTable;
