//! SQLite backend for the lix change-control engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! connection thread without blocking the async runtime. That thread is also
//! the per-instance serialization point: no two commits can interleave their
//! change-set synthesis.

mod blob;
mod cache;
mod diff;
mod encode;
mod graph;
mod materialize;
mod registry;
mod schema_sql;
mod store;
mod txn;
mod validate;
mod versions;

pub mod engine;
pub mod error;

pub use engine::{CommitOutcome, LixEngine};
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
