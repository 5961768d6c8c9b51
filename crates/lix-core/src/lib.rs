//! Core types and trait definitions for the lix change-control engine.
//!
//! This crate is deliberately free of database dependencies. It holds the
//! domain model (changes, commits, versions), the schema definition format,
//! the plugin and read-surface trait seams, and the error taxonomy. Storage
//! backends (e.g. `lix-engine-sqlite`) depend on it; it depends on nothing
//! proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod change;
pub mod commit;
pub mod diff;
pub mod error;
pub mod plugin;
pub mod reader;
pub mod schema;
pub mod state;
pub mod version;

pub use error::{Error, Result};
