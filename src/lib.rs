//! Near-real-time daily fare KPIs from a stream of trip change records.
//!
//! Change records are decoded into completed-trip events, folded into one
//! rollup per pickup date with per-partition deduplication, and published as
//! overwritable JSON snapshots.

pub mod backfill;
pub mod commit;
pub mod decoder;
pub mod driver;
pub mod engine;
pub mod publish;
pub mod retry;
pub mod rollup;
pub mod source;
pub mod store;
