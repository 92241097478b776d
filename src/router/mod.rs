//! Change router: top-level dispatch over registered per-entity hooks
//!
//! Each inbound change record is processed to completion (emitted,
//! deferred, or tombstoned) with no router-level state retained between
//! invocations; all cross-call state lives in the request-dedup and
//! tombstone caches. Hooks are registered in a table keyed by entity kind
//! rather than dispatched through subclassing.

mod hooks;

pub use hooks::default_hooks;

use crate::aggregate::{AggregateError, Aggregator};
use crate::cache::TtlCache;
use crate::emit::{EmitError, OrderedEmitter};
use crate::model::{ChangeRecord, EntityKind, Operation, RecordError};
use crate::resolver::{ReferenceResolver, Resolution, ResolveError};
use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while routing a change record.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("emit error: {0}")]
    Emit(#[from] EmitError),

    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// A wiring defect: a record reached a hook for a different entity
    /// type. Fails fast, never retried or swallowed.
    #[error("{got} record dispatched to {expected} hook")]
    WrongEntity {
        expected: EntityKind,
        got: EntityKind,
    },

    #[error("no hook registered for {0}")]
    Unroutable(EntityKind),
}

/// What one routed change produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Envelopes handed to the delivery channel.
    pub emitted: usize,
    /// Dependents deferred on a missing reference.
    pub deferred: usize,
    /// Fetch requests issued by the lookup probe path.
    pub requested: usize,
}

impl RouteOutcome {
    pub fn emitted(n: usize) -> Self {
        Self {
            emitted: n,
            ..Self::default()
        }
    }

    /// Fold another outcome into this one.
    pub fn absorb(&mut self, other: RouteOutcome) {
        self.emitted += other.emitted;
        self.deferred += other.deferred;
        self.requested += other.requested;
    }
}

/// Shared collaborators handed to every hook invocation.
pub struct RelayContext {
    pub store: Arc<dyn RecordStore>,
    pub resolver: Arc<ReferenceResolver>,
    pub emitter: OrderedEmitter,
    pub aggregator: Aggregator,
}

impl RelayContext {
    pub fn new(
        store: Arc<dyn RecordStore>,
        resolver: Arc<ReferenceResolver>,
        emitter: OrderedEmitter,
    ) -> Self {
        let aggregator = Aggregator::new(store.clone(), resolver.clone());
        Self {
            store,
            resolver,
            emitter,
            aggregator,
        }
    }
}

/// Per-entity-type sync logic invoked by the router.
#[async_trait]
pub trait ChangeHook: Send + Sync {
    /// The entity type this hook handles.
    fn entity(&self) -> EntityKind;

    /// A fresh value was applied to the local store (or probed via
    /// lookup). Runs enrichment/aggregation and emits.
    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError>;

    /// The entity was deleted; `snapshot` is its tombstoned last value.
    /// Default semantics: retract the downstream copy.
    async fn removed(
        &self,
        snapshot: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        let mut retraction = snapshot.clone();
        retraction.operation = Operation::Delete;
        cx.emitter.emit(retraction).await?;
        Ok(RouteOutcome::emitted(1))
    }
}

/// Guard against wiring defects: a hook must only ever see its own
/// entity type.
pub(crate) fn expect_entity(expected: EntityKind, record: &ChangeRecord) -> Result<(), RelayError> {
    if record.entity != expected {
        return Err(RelayError::WrongEntity {
            expected,
            got: record.entity,
        });
    }
    Ok(())
}

/// Top-level dispatcher from inbound change records to hook invocations.
pub struct ChangeRouter {
    hooks: HashMap<EntityKind, Arc<dyn ChangeHook>>,
    tombstones: TtlCache<ChangeRecord>,
    cx: RelayContext,
}

impl ChangeRouter {
    /// A router with an empty registry. Callers register hooks explicitly;
    /// most use [`ChangeRouter::with_default_hooks`].
    pub fn new(cx: RelayContext, tombstone_ttl: Duration) -> Self {
        Self {
            hooks: HashMap::new(),
            tombstones: TtlCache::new(tombstone_ttl),
            cx,
        }
    }

    /// A router wired with the full per-entity hook registry.
    pub fn with_default_hooks(cx: RelayContext, tombstone_ttl: Duration) -> Self {
        let mut router = Self::new(cx, tombstone_ttl);
        for hook in default_hooks() {
            router.register(hook);
        }
        router
    }

    pub fn register(&mut self, hook: Arc<dyn ChangeHook>) {
        self.hooks.insert(hook.entity(), hook);
    }

    pub fn context(&self) -> &RelayContext {
        &self.cx
    }

    fn hook_for(&self, entity: EntityKind) -> Result<&Arc<dyn ChangeHook>, RelayError> {
        self.hooks.get(&entity).ok_or(RelayError::Unroutable(entity))
    }

    fn tombstone_key(entity: EntityKind, key: &str) -> String {
        format!("{}::{}", entity, key)
    }

    /// Process one inbound change record to completion.
    pub async fn route(&self, record: ChangeRecord) -> Result<RouteOutcome, RelayError> {
        let hook = self.hook_for(record.entity)?;

        match record.operation {
            Operation::Insert | Operation::Update | Operation::Load => {
                self.cx.store.upsert(&record)?;
                // The entity is now locally held; lift the fetch
                // suppression so a later miss can re-request.
                self.cx.resolver.mark_arrived(record.entity, &record.key);
                hook.applied(&record, &self.cx).await
            }
            Operation::Delete => {
                let tomb_key = Self::tombstone_key(record.entity, &record.key);
                // Pre-phase: snapshot the current value before it is lost.
                // Write-if-absent so a racing pre-delete cannot clobber an
                // earlier snapshot with a staler read.
                if let Some(current) = self.cx.store.get(record.entity, &record.key)? {
                    self.tombstones.put_if_absent(&tomb_key, current);
                }
                self.cx.store.delete(record.entity, &record.key)?;

                // Post-phase: consume the tombstone and propagate removal.
                match self.tombstones.take(&tomb_key) {
                    Some(snapshot) => hook.removed(&snapshot, &self.cx).await,
                    None => {
                        debug!(entity = %record.entity, key = %record.key,
                               "delete for unknown entity, nothing to propagate");
                        Ok(RouteOutcome::default())
                    }
                }
            }
            Operation::Lookup => {
                match self.cx.store.get(record.entity, &record.key)? {
                    // Known: behave as a fresh post-save without
                    // re-persisting.
                    Some(stored) => hook.applied(&stored, &self.cx).await,
                    // Unknown: this is a request for data we don't have.
                    None => {
                        let resolution = self
                            .cx
                            .resolver
                            .resolve(record.entity, &record.key)
                            .await?;
                        info!(entity = %record.entity, key = %record.key,
                              ?resolution, "lookup miss forwarded to request path");
                        Ok(RouteOutcome {
                            requested: matches!(resolution, Resolution::Requested) as usize,
                            ..RouteOutcome::default()
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::MemoryChannel;
    use crate::testutil::{record, RecordingRequester};
    use std::sync::Mutex;

    struct CountingHook {
        entity: EntityKind,
        saw_applied: Mutex<Vec<String>>,
        saw_removed: Mutex<Vec<String>>,
    }

    impl CountingHook {
        fn new(entity: EntityKind) -> Arc<Self> {
            Arc::new(Self {
                entity,
                saw_applied: Mutex::new(Vec::new()),
                saw_removed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChangeHook for CountingHook {
        fn entity(&self) -> EntityKind {
            self.entity
        }

        async fn applied(
            &self,
            record: &ChangeRecord,
            _cx: &RelayContext,
        ) -> Result<RouteOutcome, RelayError> {
            expect_entity(self.entity, record)?;
            self.saw_applied.lock().unwrap().push(record.key.clone());
            Ok(RouteOutcome::default())
        }

        async fn removed(
            &self,
            snapshot: &ChangeRecord,
            _cx: &RelayContext,
        ) -> Result<RouteOutcome, RelayError> {
            self.saw_removed.lock().unwrap().push(
                snapshot
                    .field("name")
                    .unwrap_or_default()
                    .to_string(),
            );
            Ok(RouteOutcome::default())
        }
    }

    fn router_with(hook: Arc<dyn ChangeHook>) -> (ChangeRouter, Arc<MemoryChannel>) {
        let (store, resolver, _requester) = crate::testutil::pipeline(&[]);
        let channel = MemoryChannel::new();
        let cx = RelayContext::new(store, resolver, OrderedEmitter::new(channel.clone()));
        let mut router = ChangeRouter::new(cx, Duration::from_secs(60));
        router.register(hook);
        (router, channel)
    }

    #[tokio::test]
    async fn upsert_persists_then_invokes_hook() {
        let hook = CountingHook::new(EntityKind::Trust);
        let (router, _channel) = router_with(hook.clone());

        let mut inbound = record(EntityKind::Trust, "T1", &[("name", "Mercia")]);
        inbound.operation = Operation::Insert;
        router.route(inbound).await.unwrap();

        assert_eq!(hook.saw_applied.lock().unwrap().as_slice(), ["T1".to_string()]);
        let stored = router
            .context()
            .store
            .get(EntityKind::Trust, "T1")
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn unregistered_entity_is_unroutable() {
        let hook = CountingHook::new(EntityKind::Trust);
        let (router, _channel) = router_with(hook);

        let inbound = record(EntityKind::Site, "S1", &[]);
        let result = router.route(inbound).await;
        assert!(matches!(result, Err(RelayError::Unroutable(EntityKind::Site))));
    }

    #[tokio::test]
    async fn wrong_entity_dispatch_fails_fast() {
        let (store, resolver, _requester) = crate::testutil::pipeline(&[]);
        let channel = MemoryChannel::new();
        let cx = RelayContext::new(store, resolver, OrderedEmitter::new(channel));
        let hook = CountingHook::new(EntityKind::Trust);

        let wrong = record(EntityKind::Site, "S1", &[]);
        let result = hook.applied(&wrong, &cx).await;
        assert!(matches!(
            result,
            Err(RelayError::WrongEntity {
                expected: EntityKind::Trust,
                got: EntityKind::Site
            })
        ));
    }

    #[tokio::test]
    async fn delete_round_trips_snapshot_through_tombstone() {
        let hook = CountingHook::new(EntityKind::Trust);
        let (router, _channel) = router_with(hook.clone());

        let mut insert = record(EntityKind::Trust, "T1", &[("name", "Mercia")]);
        insert.operation = Operation::Insert;
        router.route(insert).await.unwrap();

        let mut delete = record(EntityKind::Trust, "T1", &[]);
        delete.operation = Operation::Delete;
        router.route(delete).await.unwrap();

        // The hook saw the pre-delete value, not the bare delete record.
        assert_eq!(hook.saw_removed.lock().unwrap().as_slice(), ["Mercia".to_string()]);
        // The row is gone and the tombstone was consumed.
        assert!(router
            .context()
            .store
            .get(EntityKind::Trust, "T1")
            .unwrap()
            .is_none());
        assert!(router.tombstones.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_entity_is_a_noop() {
        let hook = CountingHook::new(EntityKind::Trust);
        let (router, _channel) = router_with(hook.clone());

        let mut delete = record(EntityKind::Trust, "T9", &[]);
        delete.operation = Operation::Delete;
        let outcome = router.route(delete).await.unwrap();

        assert_eq!(outcome, RouteOutcome::default());
        assert!(hook.saw_removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_hit_reprocesses_without_persisting() {
        let hook = CountingHook::new(EntityKind::Trust);
        let (router, _channel) = router_with(hook.clone());

        let mut insert = record(EntityKind::Trust, "T1", &[("name", "Old")]);
        insert.operation = Operation::Insert;
        router.route(insert).await.unwrap();

        // Probe with different inbound fields; the stored value is what
        // the hook must see, and the store must keep it.
        let mut probe = record(EntityKind::Trust, "T1", &[("name", "ProbeNoise")]);
        probe.operation = Operation::Lookup;
        router.route(probe).await.unwrap();

        assert_eq!(hook.saw_applied.lock().unwrap().len(), 2);
        let stored = router
            .context()
            .store
            .get(EntityKind::Trust, "T1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.field("name"), Some("Old"));
    }

    #[tokio::test]
    async fn lookup_miss_goes_to_request_path() {
        let (store, resolver, requester) = crate::testutil::pipeline(&[]);
        let channel = MemoryChannel::new();
        let cx = RelayContext::new(store, resolver, OrderedEmitter::new(channel));
        let mut router = ChangeRouter::new(cx, Duration::from_secs(60));
        router.register(CountingHook::new(EntityKind::Trust));

        let mut probe = record(EntityKind::Trust, "T9", &[]);
        probe.operation = Operation::Lookup;
        let outcome = router.route(probe.clone()).await.unwrap();
        assert_eq!(outcome.requested, 1);
        assert_eq!(requester.count(), 1);

        // Second probe inside the TTL window is suppressed.
        let again = router.route(probe).await.unwrap();
        assert_eq!(again.requested, 0);
        assert_eq!(requester.count(), 1);
    }

    #[tokio::test]
    async fn upsert_evicts_request_suppression() {
        let (store, resolver, requester) = crate::testutil::pipeline(&[]);
        let channel = MemoryChannel::new();
        let cx = RelayContext::new(
            store,
            resolver.clone(),
            OrderedEmitter::new(channel),
        );
        let mut router = ChangeRouter::new(cx, Duration::from_secs(60));
        router.register(CountingHook::new(EntityKind::Trust));

        // A miss sets the suppression...
        resolver.resolve(EntityKind::Trust, "T1").await.unwrap();
        assert!(resolver.is_pending(EntityKind::Trust, "T1"));
        assert_eq!(requester.count(), 1);

        // ...and the entity arriving through the normal apply path lifts it.
        let mut insert = record(EntityKind::Trust, "T1", &[]);
        insert.operation = Operation::Insert;
        router.route(insert).await.unwrap();
        assert!(!resolver.is_pending(EntityKind::Trust, "T1"));
    }
}
