//! Storage trait definitions

use crate::model::{ChangeRecord, EntityKind};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Per-entity-type persistent key-value storage for change records.
///
/// All mutations are single-key upserts/deletes; there are no multi-key
/// transactions. Implementations must be thread-safe (Send + Sync) to
/// support concurrent pipeline tasks.
pub trait RecordStore: Send + Sync {
    /// Insert or replace the stored row for the record's key.
    fn upsert(&self, record: &ChangeRecord) -> StoreResult<()>;

    /// Load the stored row for a key, if any.
    fn get(&self, entity: EntityKind, key: &str) -> StoreResult<Option<ChangeRecord>>;

    /// Delete the stored row for a key. Returns true if a row existed.
    fn delete(&self, entity: EntityKind, key: &str) -> StoreResult<bool>;

    /// Rows of one entity type whose named field equals `value`.
    fn find_by_field(
        &self,
        entity: EntityKind,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<ChangeRecord>>;

    /// Rows of one entity type matching every `(field, value)` criterion.
    ///
    /// A criterion value of `""` also matches rows where the field is
    /// absent; similarity grouping treats missing and empty as equal.
    fn find_by_fields(
        &self,
        entity: EntityKind,
        criteria: &[(&str, &str)],
    ) -> StoreResult<Vec<ChangeRecord>>;

    /// Number of stored rows for an entity type.
    fn count(&self, entity: EntityKind) -> StoreResult<usize>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: RecordStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StoreResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StoreResult<Self>;
}
