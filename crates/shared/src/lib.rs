#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wizpix shared persistence layer
//!
//! Domain records, the `Store` persistence gateway and its PostgreSQL and
//! in-memory adapters.

pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use db::{create_pool, run_migrations};
pub use error::{StoreError, StoreResult};
pub use store::{MemoryStore, PgStore, Store};
