//! The State Store (C1): a single embedded SQLite database holding the job
//! queue, the per-path change/hash/node caches, and the signal queue, with
//! the transactional groupings mandated by spec §4.1.

mod store;

pub use store::{Error, Result, Store};
