//! Core data model: change records and the closed entity/operation registries
//!
//! Wire-facing discriminators are closed enums validated at deserialization,
//! so an unknown table or operation fails at the boundary instead of deep in
//! a sync routine.

mod entity;
mod record;

pub use entity::{EntityKind, Operation};
pub use record::{ChangeRecord, RecordError};
