//! Aggregation engine for the curriculum-membership family
//!
//! Multiple underlying rows representing the same programme enrollment
//! (split across curricula) collapse into one canonical record. The
//! reduction is deterministic: member keys sort into the composite key,
//! completion dates reduce by maximum, and curricula union by curriculum
//! id, so re-running over the same row set yields a byte-identical
//! aggregate regardless of input order.

use crate::model::{ChangeRecord, EntityKind};
use crate::resolver::{ReferenceResolver, Resolution, ResolveError};
use crate::store::{RecordStore, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while aggregating.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The grouping key that defines which curriculum-membership rows belong
/// to the same aggregate. Missing fields participate as empty strings, and
/// the store query treats missing and empty as equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimilarityKey {
    pub person_id: String,
    pub programme_id: String,
    pub membership_type: String,
    pub start_date: String,
    pub end_date: String,
}

/// Field names the similarity key is drawn from.
const SIMILARITY_FIELDS: [&str; 5] = [
    "personId",
    "programmeId",
    "programmeMembershipType",
    "programmeStartDate",
    "programmeEndDate",
];

impl SimilarityKey {
    pub fn of(record: &ChangeRecord) -> Self {
        let get = |name: &str| record.field(name).unwrap_or_default().to_string();
        Self {
            person_id: get(SIMILARITY_FIELDS[0]),
            programme_id: get(SIMILARITY_FIELDS[1]),
            membership_type: get(SIMILARITY_FIELDS[2]),
            start_date: get(SIMILARITY_FIELDS[3]),
            end_date: get(SIMILARITY_FIELDS[4]),
        }
    }

    /// Store-query criteria for fetching all rows sharing this key.
    pub fn criteria(&self) -> [(&'static str, &str); 5] {
        [
            (SIMILARITY_FIELDS[0], &self.person_id),
            (SIMILARITY_FIELDS[1], &self.programme_id),
            (SIMILARITY_FIELDS[2], &self.membership_type),
            (SIMILARITY_FIELDS[3], &self.start_date),
            (SIMILARITY_FIELDS[4], &self.end_date),
        ]
    }
}

/// One entry in the aggregate's `curricula` union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumEntry {
    #[serde(rename = "curriculumId")]
    pub curriculum_id: String,
    #[serde(rename = "curriculumName", default)]
    pub curriculum_name: String,
    #[serde(rename = "curriculumSubType", default)]
    pub curriculum_sub_type: String,
    #[serde(rename = "curriculumStartDate", default)]
    pub curriculum_start_date: String,
    #[serde(rename = "curriculumEndDate", default)]
    pub curriculum_end_date: String,
}

/// Outcome of one aggregation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// The canonical aggregate, carrying the composite key.
    Aggregated(ChangeRecord),
    /// Some member's curriculum is not yet locally held. The aggregate is
    /// unsafe to emit without complete curriculum data, so nothing is
    /// emitted; fetches are in flight for every missing curriculum.
    Deferred,
}

/// Collapses similar curriculum-membership rows into one canonical record.
pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    resolver: Arc<ReferenceResolver>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RecordStore>, resolver: Arc<ReferenceResolver>) -> Self {
        Self { store, resolver }
    }

    /// All stored rows sharing the trigger's similarity key.
    pub fn members_of(&self, key: &SimilarityKey) -> Result<Vec<ChangeRecord>, AggregateError> {
        Ok(self
            .store
            .find_by_fields(EntityKind::CurriculumMembership, &key.criteria())?)
    }

    /// Aggregate the full member set around one trigger row.
    ///
    /// Unlike ordinary enrichment, a single unresolved curriculum defers
    /// the whole aggregate: the composite key and curricula union are
    /// functions of every member, not just the trigger.
    pub async fn aggregate(
        &self,
        trigger: &ChangeRecord,
    ) -> Result<AggregateOutcome, AggregateError> {
        let similarity = SimilarityKey::of(trigger);
        let mut members = self.members_of(&similarity)?;
        // The trigger's own row belongs to the set even when it has not
        // been persisted (lookup probes re-run aggregation in place).
        if !members.iter().any(|m| m.key == trigger.key) {
            members.push(trigger.clone());
        }

        self.reduce(trigger, &members).await
    }

    /// Reduce an explicit member set. Used directly by delete handling,
    /// which aggregates the survivors after retracting the old composite.
    pub async fn reduce(
        &self,
        trigger: &ChangeRecord,
        members: &[ChangeRecord],
    ) -> Result<AggregateOutcome, AggregateError> {
        let mut curricula: BTreeMap<String, CurriculumEntry> = BTreeMap::new();
        let mut deferred = false;

        for member in members {
            // Previously-aggregated rows already carry a curricula blob;
            // their entries join the union.
            for entry in parse_curricula(member) {
                curricula.entry(entry.curriculum_id.clone()).or_insert(entry);
            }

            let Some(curriculum_id) = member.field_nonblank("curriculumId") else {
                continue;
            };
            match self
                .resolver
                .resolve(EntityKind::Curriculum, curriculum_id)
                .await?
            {
                Resolution::Found(curriculum) => {
                    let entry = CurriculumEntry {
                        curriculum_id: curriculum_id.to_string(),
                        curriculum_name: curriculum.field("name").unwrap_or_default().to_string(),
                        curriculum_sub_type: curriculum
                            .field("subType")
                            .unwrap_or_default()
                            .to_string(),
                        curriculum_start_date: member
                            .field("curriculumStartDate")
                            .unwrap_or_default()
                            .to_string(),
                        curriculum_end_date: member
                            .field("curriculumEndDate")
                            .unwrap_or_default()
                            .to_string(),
                    };
                    curricula.insert(entry.curriculum_id.clone(), entry);
                }
                // Keep iterating so every missing curriculum gets its
                // (deduplicated) fetch request in this pass.
                Resolution::Requested | Resolution::AlreadyRequested => deferred = true,
            }
        }

        if deferred {
            debug!(key = %trigger.key, "aggregation deferred on missing curricula");
            return Ok(AggregateOutcome::Deferred);
        }

        let mut keys: Vec<&str> = members.iter().map(|m| m.key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        let composite = keys.join(",");

        let mut aggregate = trigger.clone();
        aggregate.promote_key(composite);
        aggregate.set_field(
            "curricula",
            serde_json::to_string(&curricula.values().collect::<Vec<_>>())?,
        );
        if let Some(max) = max_completion_date(members) {
            aggregate.set_field("programmeCompletionDate", max.to_string());
        }

        Ok(AggregateOutcome::Aggregated(aggregate))
    }
}

/// Parse a member's embedded `curricula` JSON blob. A malformed blob is
/// logged and treated as an empty collection rather than failing the row.
fn parse_curricula(member: &ChangeRecord) -> Vec<CurriculumEntry> {
    let Some(blob) = member.field_nonblank("curricula") else {
        return Vec::new();
    };
    match serde_json::from_str(blob) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(key = %member.key, %error, "unparseable curricula blob, treating as empty");
            Vec::new()
        }
    }
}

/// Maximum of the members' completion dates. Absent and unparseable dates
/// are ignored.
fn max_completion_date(members: &[ChangeRecord]) -> Option<NaiveDate> {
    members
        .iter()
        .filter_map(|m| m.field_nonblank("programmeCompletionDate"))
        .filter_map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
        .max()
}
