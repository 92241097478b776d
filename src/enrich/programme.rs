//! Programme-family enrichment

use super::{copy_nonblank, resolve_reference, EnrichOutcome, RefLookup};
use crate::model::{ChangeRecord, EntityKind};
use crate::resolver::{ReferenceResolver, ResolveError};
use tracing::debug;

/// Enrich a programme with its owning local office name and designated
/// body code. Both relations are optional; only a reference that exists
/// but is not yet locally held defers.
pub async fn enrich_programme(
    resolver: &ReferenceResolver,
    programme: &mut ChangeRecord,
) -> Result<EnrichOutcome, ResolveError> {
    let local_office = resolve_reference(
        resolver,
        EntityKind::LocalOffice,
        programme.field("localOfficeId"),
    )
    .await?;
    let dbc = resolve_reference(resolver, EntityKind::Dbc, programme.field("dbcId")).await?;

    let (Some(owner), Some(code)) = (local_office.field("name"), dbc.field("code")) else {
        debug!(key = %programme.key, "programme enrichment deferred");
        return Ok(EnrichOutcome::Deferred);
    };

    copy_nonblank(programme, "owner", &owner);
    copy_nonblank(programme, "designatedBodyCode", &code);
    Ok(EnrichOutcome::Complete)
}

/// Copy programme fields into a membership from a programme record
/// already in hand: `programmeName`, `programmeNumber`, and
/// `managingDeanery` (the programme's owner). Used directly by the
/// programme-triggered fan-out, where the (possibly just-enriched)
/// programme is the trigger itself.
pub fn copy_programme_fields(programme: &ChangeRecord, membership: &mut ChangeRecord) {
    for (target, source) in [
        ("programmeName", "name"),
        ("programmeNumber", "number"),
        ("managingDeanery", "owner"),
    ] {
        if let Some(value) = programme.field(source) {
            copy_nonblank(membership, target, value);
        }
    }
}

/// Enrich a programme membership by resolving its programme reference.
/// The membership-triggered path; defers until the programme is held.
pub async fn enrich_programme_membership(
    resolver: &ReferenceResolver,
    membership: &mut ChangeRecord,
) -> Result<EnrichOutcome, ResolveError> {
    let programme = resolve_reference(
        resolver,
        EntityKind::Programme,
        membership.field("programmeId"),
    )
    .await?;

    match programme {
        RefLookup::Found(programme) => {
            copy_programme_fields(&programme, membership);
            Ok(EnrichOutcome::Complete)
        }
        RefLookup::Empty => Ok(EnrichOutcome::Complete),
        RefLookup::Missing => {
            debug!(key = %membership.key, "programme membership enrichment deferred");
            Ok(EnrichOutcome::Deferred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;
    use crate::testutil::{pipeline, record};

    #[tokio::test]
    async fn programme_copies_owner_and_dbc_code() {
        let (_store, resolver, _requester) = pipeline(&[
            record(EntityKind::LocalOffice, "LO1", &[("name", "Deanery A")]),
            record(EntityKind::Dbc, "D1", &[("code", "1-DBC")]),
        ]);

        let mut programme = record(
            EntityKind::Programme,
            "P1",
            &[("localOfficeId", "LO1"), ("dbcId", "D1")],
        );
        let outcome = enrich_programme(&resolver, &mut programme).await.unwrap();

        assert_eq!(outcome, EnrichOutcome::Complete);
        assert_eq!(programme.field("owner"), Some("Deanery A"));
        assert_eq!(programme.field("designatedBodyCode"), Some("1-DBC"));
    }

    #[tokio::test]
    async fn programme_without_references_is_complete() {
        let (_store, resolver, requester) = pipeline(&[]);

        let mut programme = record(EntityKind::Programme, "P1", &[("name", "Cardiology")]);
        let outcome = enrich_programme(&resolver, &mut programme).await.unwrap();

        assert_eq!(outcome, EnrichOutcome::Complete);
        assert_eq!(programme.field("owner"), None);
        assert_eq!(requester.count(), 0);
    }

    #[tokio::test]
    async fn programme_defers_on_missing_local_office() {
        let (_store, resolver, requester) = pipeline(&[]);

        let mut programme = record(EntityKind::Programme, "P1", &[("localOfficeId", "LO9")]);
        let outcome = enrich_programme(&resolver, &mut programme).await.unwrap();

        assert_eq!(outcome, EnrichOutcome::Deferred);
        assert_eq!(requester.count(), 1);
    }

    #[tokio::test]
    async fn membership_copies_programme_fields() {
        let (_store, resolver, _requester) = pipeline(&[record(
            EntityKind::Programme,
            "P5",
            &[
                ("name", "General Practice"),
                ("number", "GP-05"),
                ("owner", "Deanery A"),
            ],
        )]);

        let mut membership = record(
            EntityKind::ProgrammeMembership,
            "0e1f2a3b-4c5d-6e7f-8a9b-0c1d2e3f4a5b",
            &[("programmeId", "P5")],
        );
        let outcome = enrich_programme_membership(&resolver, &mut membership)
            .await
            .unwrap();

        assert_eq!(outcome, EnrichOutcome::Complete);
        assert_eq!(membership.field("programmeName"), Some("General Practice"));
        assert_eq!(membership.field("programmeNumber"), Some("GP-05"));
        assert_eq!(membership.field("managingDeanery"), Some("Deanery A"));
    }

    #[tokio::test]
    async fn membership_defers_until_programme_arrives() {
        let (store, resolver, requester) = pipeline(&[]);

        let mut membership = record(
            EntityKind::ProgrammeMembership,
            "1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed",
            &[("programmeId", "P5")],
        );
        let outcome = enrich_programme_membership(&resolver, &mut membership)
            .await
            .unwrap();
        assert_eq!(outcome, EnrichOutcome::Deferred);
        assert_eq!(requester.count(), 1);

        // The programme arrives; re-running the same path now completes.
        store
            .upsert(&record(EntityKind::Programme, "P5", &[("name", "GP")]))
            .unwrap();
        resolver.mark_arrived(EntityKind::Programme, "P5");

        let retried = enrich_programme_membership(&resolver, &mut membership)
            .await
            .unwrap();
        assert_eq!(retried, EnrichOutcome::Complete);
        assert_eq!(membership.field("programmeName"), Some("GP"));
    }
}
