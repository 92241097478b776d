//! Shared test fixtures

use crate::model::{ChangeRecord, EntityKind, Operation};
use crate::resolver::{FetchRequester, ReferenceResolver};
use crate::store::{OpenStore, RecordStore, SqliteStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Requester that records every fetch request it receives.
pub(crate) struct RecordingRequester {
    pub requests: Mutex<Vec<(EntityKind, String)>>,
    fail: bool,
}

impl RecordingRequester {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl FetchRequester for RecordingRequester {
    async fn request(&self, entity: EntityKind, key: &str) -> Result<(), String> {
        if self.fail {
            return Err("queue unreachable".to_string());
        }
        self.requests
            .lock()
            .unwrap()
            .push((entity, key.to_string()));
        Ok(())
    }
}

/// A stored-snapshot record with the given fields.
pub(crate) fn record(entity: EntityKind, key: &str, fields: &[(&str, &str)]) -> ChangeRecord {
    let mut r = ChangeRecord::new("tcs", entity, Operation::Load, key, BTreeMap::new());
    for (name, value) in fields {
        r.set_field(*name, *value);
    }
    r
}

/// In-memory store seeded with the given records.
pub(crate) fn store_with(records: &[ChangeRecord]) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for r in records {
        store.upsert(r).unwrap();
    }
    store
}

/// Store + resolver + recording requester wired together with a long TTL.
pub(crate) fn pipeline(
    records: &[ChangeRecord],
) -> (Arc<SqliteStore>, Arc<ReferenceResolver>, Arc<RecordingRequester>) {
    let store = store_with(records);
    let requester = RecordingRequester::new();
    let resolver = Arc::new(ReferenceResolver::new(
        store.clone(),
        Duration::from_secs(300),
        requester.clone(),
    ));
    (store, resolver, requester)
}
