//! Cascade: change-data-capture relay for trainee records
//!
//! Cascade observes mutations to denormalized entity collections,
//! determines which other entities each mutation affects, enriches the
//! affected records with fields copied from related entities, collapses
//! similar curriculum-membership rows into one canonical aggregate, and
//! republishes the result to an ordered, per-entity delivery channel.
//!
//! # Core Concepts
//!
//! - **Change Router**: dispatches inbound change records to per-entity hooks
//! - **Reference Resolver**: local reads with deduplicated request-on-miss
//! - **Aggregator**: deterministic fan-in of similar membership rows
//! - **Ordered Emitter**: per-group-key sequential delivery downstream
//!
//! # Example
//!
//! ```
//! use cascade::{
//!     ChangeRouter, ChannelRequester, MemoryChannel, OpenStore, OrderedEmitter,
//!     ReferenceResolver, RelayContext, SqliteStore,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(SqliteStore::open_in_memory().unwrap());
//! let channel = MemoryChannel::new();
//! let requester = Arc::new(ChannelRequester::new("tcs", channel.clone()));
//! let resolver = Arc::new(ReferenceResolver::new(
//!     store.clone(),
//!     Duration::from_secs(300),
//!     requester,
//! ));
//! let cx = RelayContext::new(store, resolver, OrderedEmitter::new(channel));
//! let router = ChangeRouter::with_default_hooks(cx, Duration::from_secs(60));
//! // Router is ready to process inbound change records.
//! # let _ = router;
//! ```

pub mod aggregate;
pub mod cache;
pub mod emit;
pub mod enrich;
pub mod model;
pub mod resolver;
pub mod router;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testutil;

pub use aggregate::{
    AggregateError, AggregateOutcome, Aggregator, CurriculumEntry, SimilarityKey,
};
pub use cache::TtlCache;
pub use emit::{
    group_key, ChannelRequester, DeliveryChannel, DeliveryEnvelope, EmitError, MemoryChannel,
    OrderedEmitter, WriterChannel,
};
pub use enrich::EnrichOutcome;
pub use model::{ChangeRecord, EntityKind, Operation, RecordError};
pub use resolver::{FetchRequester, ReferenceResolver, Resolution, ResolveError};
pub use router::{
    default_hooks, ChangeHook, ChangeRouter, RelayContext, RelayError, RouteOutcome,
};
pub use store::{OpenStore, RecordStore, SqliteStore, StoreError, StoreResult};
pub use sync::{ReferenceSyncClient, SyncError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
