//! The per-entity hook registry
//!
//! One hook per entity type, each wiring the enrichment/aggregation
//! routines to the fan-out queries for that type. Reference types emit
//! themselves first, then refresh their dependents; dependent types
//! enrich (or aggregate) themselves and emit only when complete.

use super::{expect_entity, ChangeHook, RelayContext, RelayError, RouteOutcome};
use crate::aggregate::{AggregateOutcome, SimilarityKey};
use crate::enrich::{
    copy_programme_fields, enrich_placement, enrich_programme, enrich_programme_membership,
    EnrichOutcome,
};
use crate::model::{ChangeRecord, EntityKind, Operation};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every hook in the registry, in entity order.
pub fn default_hooks() -> Vec<Arc<dyn ChangeHook>> {
    vec![
        Arc::new(TrustHook),
        Arc::new(SiteHook),
        Arc::new(PostHook),
        Arc::new(PlacementHook),
        Arc::new(ProgrammeHook),
        Arc::new(LocalOfficeHook),
        Arc::new(DbcHook),
        Arc::new(CurriculumHook),
        Arc::new(ProgrammeMembershipHook),
        Arc::new(CurriculumMembershipHook),
        Arc::new(PassthroughHook::new(EntityKind::ConditionsOfJoining)),
        Arc::new(PassthroughHook::new(EntityKind::PostSpecialty)),
        Arc::new(PassthroughHook::new(EntityKind::PlacementSite)),
        Arc::new(PassthroughHook::new(EntityKind::PlacementSpecialty)),
        Arc::new(PassthroughHook::new(EntityKind::Person)),
    ]
}

/// Republish the record as-is under its routed group key.
async fn emit_as_is(cx: &RelayContext, record: &ChangeRecord) -> Result<RouteOutcome, RelayError> {
    cx.emitter.emit(record.clone()).await?;
    Ok(RouteOutcome::emitted(1))
}

/// Enrich one placement snapshot and emit it if complete.
async fn enrich_and_emit_placement(
    cx: &RelayContext,
    placement: &ChangeRecord,
) -> Result<RouteOutcome, RelayError> {
    let mut placement = placement.clone();
    match enrich_placement(&cx.resolver, &mut placement).await? {
        EnrichOutcome::Complete => emit_as_is(cx, &placement).await,
        EnrichOutcome::Deferred => Ok(RouteOutcome {
            deferred: 1,
            ..RouteOutcome::default()
        }),
    }
}

/// Enrich one programme-membership snapshot and emit it if complete.
async fn enrich_and_emit_membership(
    cx: &RelayContext,
    membership: &ChangeRecord,
) -> Result<RouteOutcome, RelayError> {
    let mut membership = membership.clone();
    match enrich_programme_membership(&cx.resolver, &mut membership).await? {
        EnrichOutcome::Complete => emit_as_is(cx, &membership).await,
        EnrichOutcome::Deferred => Ok(RouteOutcome {
            deferred: 1,
            ..RouteOutcome::default()
        }),
    }
}

/// Aggregate around one curriculum-membership trigger and emit the
/// composite if every member's curriculum resolved.
async fn aggregate_and_emit(
    cx: &RelayContext,
    trigger: &ChangeRecord,
) -> Result<RouteOutcome, RelayError> {
    match cx.aggregator.aggregate(trigger).await? {
        AggregateOutcome::Aggregated(aggregate) => emit_as_is(cx, &aggregate).await,
        AggregateOutcome::Deferred => Ok(RouteOutcome {
            deferred: 1,
            ..RouteOutcome::default()
        }),
    }
}

/// Re-enrich every placement hanging off one post.
async fn refresh_post_placements(
    cx: &RelayContext,
    post_key: &str,
) -> Result<RouteOutcome, RelayError> {
    let mut outcome = RouteOutcome::default();
    for placement in cx
        .store
        .find_by_field(EntityKind::Placement, "postId", post_key)?
    {
        outcome.absorb(enrich_and_emit_placement(cx, &placement).await?);
    }
    Ok(outcome)
}

/// Re-aggregate a set of curriculum-membership rows, once per similarity
/// group rather than once per row.
async fn reaggregate_groups(
    cx: &RelayContext,
    rows: Vec<ChangeRecord>,
) -> Result<RouteOutcome, RelayError> {
    let mut triggers: BTreeMap<String, ChangeRecord> = BTreeMap::new();
    for row in rows {
        let similarity = SimilarityKey::of(&row);
        let group = format!(
            "{}|{}|{}|{}|{}",
            similarity.person_id,
            similarity.programme_id,
            similarity.membership_type,
            similarity.start_date,
            similarity.end_date
        );
        triggers.entry(group).or_insert(row);
    }

    let mut outcome = RouteOutcome::default();
    for trigger in triggers.values() {
        outcome.absorb(aggregate_and_emit(cx, trigger).await?);
    }
    Ok(outcome)
}

/// The full Programme apply path: enrich and emit the programme, then
/// refresh its memberships. Shared with the LocalOffice/Dbc cascades.
async fn programme_applied(
    cx: &RelayContext,
    programme: &ChangeRecord,
) -> Result<RouteOutcome, RelayError> {
    let mut enriched = programme.clone();
    let mut outcome = RouteOutcome::default();
    match enrich_programme(&cx.resolver, &mut enriched).await? {
        EnrichOutcome::Complete => outcome.absorb(emit_as_is(cx, &enriched).await?),
        EnrichOutcome::Deferred => outcome.deferred += 1,
    }

    // Memberships copy from the programme in hand (including any owner
    // just derived from its local office), not from a re-resolve of the
    // stored row; stored rows never carry derived fields.
    for mut membership in cx.store.find_by_field(
        EntityKind::ProgrammeMembership,
        "programmeId",
        &programme.key,
    )? {
        copy_programme_fields(&enriched, &mut membership);
        outcome.absorb(emit_as_is(cx, &membership).await?);
    }

    let memberships = cx.store.find_by_field(
        EntityKind::CurriculumMembership,
        "programmeId",
        &programme.key,
    )?;
    outcome.absorb(reaggregate_groups(cx, memberships).await?);

    Ok(outcome)
}

struct TrustHook;

#[async_trait]
impl ChangeHook for TrustHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Trust
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Trust, record)?;
        let mut outcome = emit_as_is(cx, record).await?;

        // A trust can appear as employing and training body; posts are
        // deduplicated so their placements refresh once.
        let mut posts: BTreeMap<String, ChangeRecord> = BTreeMap::new();
        for role in ["employingBodyId", "trainingBodyId"] {
            for post in cx.store.find_by_field(EntityKind::Post, role, &record.key)? {
                posts.entry(post.key.clone()).or_insert(post);
            }
        }
        for post_key in posts.keys() {
            outcome.absorb(refresh_post_placements(cx, post_key).await?);
        }
        Ok(outcome)
    }
}

struct SiteHook;

#[async_trait]
impl ChangeHook for SiteHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Site
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Site, record)?;
        let mut outcome = emit_as_is(cx, record).await?;
        for placement in cx
            .store
            .find_by_field(EntityKind::Placement, "siteId", &record.key)?
        {
            outcome.absorb(enrich_and_emit_placement(cx, &placement).await?);
        }
        Ok(outcome)
    }
}

struct PostHook;

#[async_trait]
impl ChangeHook for PostHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Post
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Post, record)?;
        let mut outcome = emit_as_is(cx, record).await?;
        outcome.absorb(refresh_post_placements(cx, &record.key).await?);
        Ok(outcome)
    }
}

struct PlacementHook;

#[async_trait]
impl ChangeHook for PlacementHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Placement
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Placement, record)?;
        enrich_and_emit_placement(cx, record).await
    }
}

struct ProgrammeHook;

#[async_trait]
impl ChangeHook for ProgrammeHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Programme
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Programme, record)?;
        programme_applied(cx, record).await
    }
}

struct LocalOfficeHook;

#[async_trait]
impl ChangeHook for LocalOfficeHook {
    fn entity(&self) -> EntityKind {
        EntityKind::LocalOffice
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::LocalOffice, record)?;
        let mut outcome = emit_as_is(cx, record).await?;
        for programme in cx
            .store
            .find_by_field(EntityKind::Programme, "localOfficeId", &record.key)?
        {
            outcome.absorb(programme_applied(cx, &programme).await?);
        }
        Ok(outcome)
    }
}

struct DbcHook;

#[async_trait]
impl ChangeHook for DbcHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Dbc
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Dbc, record)?;
        let mut outcome = emit_as_is(cx, record).await?;
        for programme in cx
            .store
            .find_by_field(EntityKind::Programme, "dbcId", &record.key)?
        {
            outcome.absorb(programme_applied(cx, &programme).await?);
        }
        Ok(outcome)
    }
}

struct CurriculumHook;

#[async_trait]
impl ChangeHook for CurriculumHook {
    fn entity(&self) -> EntityKind {
        EntityKind::Curriculum
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::Curriculum, record)?;
        let mut outcome = emit_as_is(cx, record).await?;
        // The resume path for deferred aggregates: a curriculum arriving
        // re-triggers every membership that referenced it.
        let memberships = cx.store.find_by_field(
            EntityKind::CurriculumMembership,
            "curriculumId",
            &record.key,
        )?;
        outcome.absorb(reaggregate_groups(cx, memberships).await?);
        Ok(outcome)
    }
}

struct ProgrammeMembershipHook;

#[async_trait]
impl ChangeHook for ProgrammeMembershipHook {
    fn entity(&self) -> EntityKind {
        EntityKind::ProgrammeMembership
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::ProgrammeMembership, record)?;
        enrich_and_emit_membership(cx, record).await
    }
}

struct CurriculumMembershipHook;

#[async_trait]
impl ChangeHook for CurriculumMembershipHook {
    fn entity(&self) -> EntityKind {
        EntityKind::CurriculumMembership
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(EntityKind::CurriculumMembership, record)?;
        aggregate_and_emit(cx, record).await
    }

    /// Deleting one member changes the aggregate's composite key, so the
    /// stale aggregate is retracted first, then the survivors republish
    /// under their new key.
    async fn removed(
        &self,
        snapshot: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        let similarity = SimilarityKey::of(snapshot);
        let remaining = cx.aggregator.members_of(&similarity)?;

        let mut keys: Vec<&str> = remaining.iter().map(|m| m.key.as_str()).collect();
        keys.push(snapshot.key.as_str());
        keys.sort_unstable();
        keys.dedup();
        let previous_composite = keys.join(",");

        let mut retraction = snapshot.clone();
        retraction.operation = Operation::Delete;
        retraction.promote_key(previous_composite);
        cx.emitter.emit(retraction).await?;
        let mut outcome = RouteOutcome::emitted(1);

        if let Some(survivor) = remaining.first() {
            match cx.aggregator.reduce(survivor, &remaining).await? {
                AggregateOutcome::Aggregated(aggregate) => {
                    outcome.absorb(emit_as_is(cx, &aggregate).await?)
                }
                AggregateOutcome::Deferred => outcome.deferred += 1,
            }
        }
        Ok(outcome)
    }
}

/// Hook for child types that need no enrichment of their own: republish,
/// group-routed behind the logical parent.
struct PassthroughHook {
    entity: EntityKind,
}

impl PassthroughHook {
    fn new(entity: EntityKind) -> Self {
        Self { entity }
    }
}

#[async_trait]
impl ChangeHook for PassthroughHook {
    fn entity(&self) -> EntityKind {
        self.entity
    }

    async fn applied(
        &self,
        record: &ChangeRecord,
        cx: &RelayContext,
    ) -> Result<RouteOutcome, RelayError> {
        expect_entity(self.entity, record)?;
        emit_as_is(cx, record).await
    }
}
