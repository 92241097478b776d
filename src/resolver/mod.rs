//! Reference resolver: local reads with request-and-defer on miss
//!
//! A miss never blocks. The resolver issues at most one asynchronous fetch
//! request per (entity, key) per TTL window; repeat misses inside the window
//! are suppressed by the request-dedup cache. That suppression is the
//! backpressure guarantee against request storms when a popular reference
//! is missing.

use crate::cache::TtlCache;
use crate::model::{ChangeRecord, EntityKind};
use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while resolving a reference.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("fetch request for {entity} {key} failed: {message}")]
    Request {
        entity: EntityKind,
        key: String,
        message: String,
    },
}

/// Outcome of a reference lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The value is locally held; no side effect.
    Found(ChangeRecord),
    /// Missing; a fetch request was issued by this call.
    Requested,
    /// Missing; a fetch is already in flight within the TTL window.
    AlreadyRequested,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// Seam for issuing an asynchronous upstream fetch request.
///
/// Fire-and-forget: the fetched entity arrives later as a fresh inbound
/// change, which re-triggers whatever deferred on the miss.
#[async_trait]
pub trait FetchRequester: Send + Sync {
    async fn request(&self, entity: EntityKind, key: &str) -> Result<(), String>;
}

/// Resolves entity references from the local store, requesting misses.
pub struct ReferenceResolver {
    store: Arc<dyn RecordStore>,
    pending: TtlCache<()>,
    requester: Arc<dyn FetchRequester>,
}

impl ReferenceResolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        request_ttl: Duration,
        requester: Arc<dyn FetchRequester>,
    ) -> Self {
        Self {
            store,
            pending: TtlCache::new(request_ttl),
            requester,
        }
    }

    /// The request-dedup cache key for one reference.
    pub fn request_key(entity: EntityKind, key: &str) -> String {
        format!("{}::{}::request", entity, key)
    }

    /// Resolve one reference, requesting a fetch on first miss.
    pub async fn resolve(
        &self,
        entity: EntityKind,
        key: &str,
    ) -> Result<Resolution, ResolveError> {
        if let Some(record) = self.store.get(entity, key)? {
            return Ok(Resolution::Found(record));
        }

        if !self.pending.put_if_absent(Self::request_key(entity, key), ()) {
            return Ok(Resolution::AlreadyRequested);
        }

        match self.requester.request(entity, key).await {
            Ok(()) => {
                debug!(%entity, key, "requested missing reference");
                Ok(Resolution::Requested)
            }
            Err(message) => {
                // Release the claim so a redelivery can re-request without
                // waiting out the TTL.
                self.pending.evict(&Self::request_key(entity, key));
                Err(ResolveError::Request {
                    entity,
                    key: key.to_string(),
                    message,
                })
            }
        }
    }

    /// Called on the change-apply path when an entity is written locally.
    /// Evicts the dedup entry so a later miss can re-request immediately.
    pub fn mark_arrived(&self, entity: EntityKind, key: &str) {
        self.pending.evict(&Self::request_key(entity, key));
    }

    /// Whether a fetch for this reference is currently suppressed.
    pub fn is_pending(&self, entity: EntityKind, key: &str) -> bool {
        self.pending.contains(&Self::request_key(entity, key))
    }
}
