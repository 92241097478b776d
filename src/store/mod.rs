//! Local store: the system of record for locally-held denormalized entities
//!
//! The relay reads and writes through the `RecordStore` trait. The primary
//! implementation is `SqliteStore`; tests use its in-memory form.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{OpenStore, RecordStore, StoreError, StoreResult};
