//! Ordered emission to the downstream delivery channel
//!
//! Every envelope carries a deterministic group key; the channel guarantees
//! per-group submission order and nothing across groups. Child record types
//! serialize behind their logical parent via a plain per-table routing map
//! with no reflection and nothing hidden in a proxy.

use crate::model::{ChangeRecord, EntityKind, Operation};
use crate::resolver::FetchRequester;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Errors from emission.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("delivery channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One message bound for the downstream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// Ordering partition key: `<schema>_<routedTable>_<routedId>`.
    #[serde(rename = "groupKey")]
    pub group_key: String,
    /// Deduplication id, set only on request-for-missing-data envelopes.
    #[serde(rename = "dedupKey", skip_serializing_if = "Option::is_none", default)]
    pub dedup_key: Option<String>,
    pub payload: ChangeRecord,
}

/// Per-table routing: which parent a record must serialize behind.
///
/// Default (no entry) routes a record under its own table and id. A child
/// whose parent-id field is absent falls back to its own key, degrading to
/// per-record ordering rather than dropping the envelope.
fn route(record: &ChangeRecord) -> (EntityKind, String) {
    let parent = |field: &str, table: EntityKind| {
        let id = record
            .field_nonblank(field)
            .unwrap_or(record.key.as_str())
            .to_string();
        (table, id)
    };

    match record.entity {
        EntityKind::ConditionsOfJoining | EntityKind::CurriculumMembership => {
            parent("programmeMembershipUuid", EntityKind::ProgrammeMembership)
        }
        EntityKind::PlacementSite | EntityKind::PlacementSpecialty => {
            parent("placementId", EntityKind::Placement)
        }
        EntityKind::PostSpecialty => parent("postId", EntityKind::Post),
        other => (other, record.key.clone()),
    }
}

/// Compute a record's ordering partition key.
pub fn group_key(record: &ChangeRecord) -> String {
    let (table, id) = route(record);
    format!("{}_{}_{}", record.schema, table, id)
}

/// The seam to the downstream ordered channel.
///
/// Implementations must deliver envelopes sharing a group key in
/// submission order. No in-process retry: delivery failures surface to the
/// caller, and redelivery is the inbound queue's concern.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, envelope: DeliveryEnvelope) -> Result<(), EmitError>;
}

/// Publishes enriched/aggregated records with per-entity ordering.
#[derive(Clone)]
pub struct OrderedEmitter {
    channel: Arc<dyn DeliveryChannel>,
}

impl OrderedEmitter {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { channel }
    }

    /// Emit one record under its routed group key.
    pub async fn emit(&self, record: ChangeRecord) -> Result<(), EmitError> {
        let envelope = DeliveryEnvelope {
            group_key: group_key(&record),
            dedup_key: None,
            payload: record,
        };
        debug!(group_key = %envelope.group_key, "emitting");
        self.channel.deliver(envelope).await
    }
}

/// Issues fetch requests as deduplicated envelopes on a delivery channel.
///
/// The payload is a lookup-operation record carrying only the id; the
/// dedup key lets the queue collapse duplicates that race past the
/// in-process suppression window.
pub struct ChannelRequester {
    schema: String,
    channel: Arc<dyn DeliveryChannel>,
}

impl ChannelRequester {
    pub fn new(schema: impl Into<String>, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self {
            schema: schema.into(),
            channel,
        }
    }
}

#[async_trait]
impl FetchRequester for ChannelRequester {
    async fn request(&self, entity: EntityKind, key: &str) -> Result<(), String> {
        let payload = ChangeRecord::new(
            self.schema.clone(),
            entity,
            Operation::Lookup,
            key,
            BTreeMap::new(),
        );
        let envelope = DeliveryEnvelope {
            group_key: format!("{}_request_{}_{}", self.schema, entity, key),
            dedup_key: Some(format!("{}::{}::request", entity, key)),
            payload,
        };
        self.channel
            .deliver(envelope)
            .await
            .map_err(|e| e.to_string())
    }
}

/// In-memory channel that records deliveries in submission order.
///
/// Used by tests and by anything that wants to inspect the outbound
/// stream without a real queue.
#[derive(Default)]
pub struct MemoryChannel {
    delivered: Mutex<Vec<DeliveryEnvelope>>,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything delivered so far, in submission order.
    pub fn delivered(&self) -> Vec<DeliveryEnvelope> {
        self.delivered.lock().unwrap().clone()
    }

    /// Envelopes for one group key, in submission order.
    pub fn group(&self, group_key: &str) -> Vec<DeliveryEnvelope> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.group_key == group_key)
            .cloned()
            .collect()
    }

    /// The request-for-missing-data envelopes only.
    pub fn requests(&self) -> Vec<DeliveryEnvelope> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.dedup_key.is_some())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn deliver(&self, envelope: DeliveryEnvelope) -> Result<(), EmitError> {
        self.delivered.lock().unwrap().push(envelope);
        Ok(())
    }
}

/// Channel writing envelopes as newline-delimited JSON to a writer.
///
/// The single writer lock serializes all groups, which trivially
/// preserves per-group submission order.
pub struct WriterChannel<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: Write + Send> DeliveryChannel for WriterChannel<W> {
    async fn deliver(&self, envelope: DeliveryEnvelope) -> Result<(), EmitError> {
        let line = serde_json::to_string(&envelope)?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{}", line).map_err(|e| EmitError::Channel(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| EmitError::Channel(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;

    #[test]
    fn default_routing_uses_own_table_and_id() {
        let trust = record(EntityKind::Trust, "T1", &[]);
        assert_eq!(group_key(&trust), "tcs_Trust_T1");
    }

    #[test]
    fn children_serialize_behind_their_parent() {
        let uuid = "1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed";
        let coj = record(
            EntityKind::ConditionsOfJoining,
            "CJ1",
            &[("programmeMembershipUuid", uuid)],
        );
        assert_eq!(
            group_key(&coj),
            format!("tcs_ProgrammeMembership_{}", uuid)
        );

        let cm = record(
            EntityKind::CurriculumMembership,
            "10,11",
            &[("programmeMembershipUuid", uuid)],
        );
        assert_eq!(
            group_key(&cm),
            format!("tcs_ProgrammeMembership_{}", uuid)
        );

        let ps = record(EntityKind::PlacementSite, "PS1", &[("placementId", "PL7")]);
        assert_eq!(group_key(&ps), "tcs_Placement_PL7");

        let posts = record(EntityKind::PostSpecialty, "X1", &[("postId", "P2")]);
        assert_eq!(group_key(&posts), "tcs_Post_P2");
    }

    #[test]
    fn child_without_parent_id_falls_back_to_own_key() {
        let orphan = record(EntityKind::PlacementSpecialty, "PSP1", &[]);
        assert_eq!(group_key(&orphan), "tcs_Placement_PSP1");
    }

    #[tokio::test]
    async fn emitter_preserves_submission_order_per_group() {
        let channel = MemoryChannel::new();
        let emitter = OrderedEmitter::new(channel.clone());

        for n in 0..3 {
            let r = record(EntityKind::Placement, "PL1", &[("seq", &n.to_string())]);
            emitter.emit(r).await.unwrap();
        }
        emitter
            .emit(record(EntityKind::Placement, "PL2", &[]))
            .await
            .unwrap();

        let group = channel.group("tcs_Placement_PL1");
        let seqs: Vec<_> = group
            .iter()
            .map(|e| e.payload.field("seq").unwrap().to_string())
            .collect();
        assert_eq!(seqs, vec!["0", "1", "2"]);
        assert_eq!(channel.group("tcs_Placement_PL2").len(), 1);
    }

    #[tokio::test]
    async fn requester_envelopes_carry_dedup_key() {
        let channel = MemoryChannel::new();
        let requester = ChannelRequester::new("tcs", channel.clone());

        requester
            .request(EntityKind::Trust, "T9")
            .await
            .unwrap();

        let requests = channel.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].dedup_key.as_deref(), Some("Trust::T9::request"));
        assert_eq!(requests[0].group_key, "tcs_request_Trust_T9");
        assert_eq!(requests[0].payload.operation, Operation::Lookup);
        assert_eq!(requests[0].payload.key, "T9");
    }

    #[tokio::test]
    async fn writer_channel_emits_ndjson() {
        let buffer: Vec<u8> = Vec::new();
        let channel = WriterChannel::new(buffer);
        let envelope = DeliveryEnvelope {
            group_key: "tcs_Trust_T1".to_string(),
            dedup_key: None,
            payload: record(EntityKind::Trust, "T1", &[("name", "Mercia")]),
        };
        channel.deliver(envelope.clone()).await.unwrap();

        let written = channel.writer.into_inner().unwrap();
        let line = String::from_utf8(written).unwrap();
        let parsed: DeliveryEnvelope = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed.group_key, envelope.group_key);
        assert_eq!(parsed.payload.field("name"), Some("Mercia"));
    }
}
