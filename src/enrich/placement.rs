//! Placement enrichment: body names via the Post, site fields via the Site

use super::{copy_nonblank, resolve_reference, EnrichOutcome, RefLookup};
use crate::model::{ChangeRecord, EntityKind};
use crate::resolver::{ReferenceResolver, ResolveError};
use tracing::debug;

/// Enrich a placement with `employingBodyName`/`trainingBodyName` (from the
/// Post's Trust references) and `siteName`/`siteLocation` (from its Site).
///
/// Defers if the Post, either required Trust, or the Site is not yet
/// locally held. A Post whose Trust ids are null resolves those names to
/// empty; some posts legitimately have no training body.
pub async fn enrich_placement(
    resolver: &ReferenceResolver,
    placement: &mut ChangeRecord,
) -> Result<EnrichOutcome, ResolveError> {
    let mut pending = false;
    let mut resolved: Vec<(&str, String)> = Vec::new();

    match resolve_reference(resolver, EntityKind::Post, placement.field("postId")).await? {
        RefLookup::Found(post) => {
            let employing_id = post.field_nonblank("employingBodyId").map(str::to_owned);
            let training_id = post.field_nonblank("trainingBodyId").map(str::to_owned);

            let employing =
                resolve_reference(resolver, EntityKind::Trust, employing_id.as_deref()).await?;
            // A trust acting as both employing and training body resolves
            // once; the dedup cache makes the second lookup free either way.
            let training = if training_id == employing_id {
                employing.clone()
            } else {
                resolve_reference(resolver, EntityKind::Trust, training_id.as_deref()).await?
            };

            match (employing.field("name"), training.field("name")) {
                (Some(employing_name), Some(training_name)) => {
                    resolved.push(("employingBodyName", employing_name));
                    resolved.push(("trainingBodyName", training_name));
                }
                _ => pending = true,
            }
        }
        RefLookup::Empty => {}
        RefLookup::Missing => pending = true,
    }

    match resolve_reference(resolver, EntityKind::Site, placement.field("siteId")).await? {
        site @ (RefLookup::Found(_) | RefLookup::Empty) => {
            if let (Some(name), Some(location)) = (site.field("name"), site.field("location")) {
                resolved.push(("siteName", name));
                resolved.push(("siteLocation", location));
            }
        }
        RefLookup::Missing => pending = true,
    }

    if pending {
        debug!(key = %placement.key, "placement enrichment deferred");
        return Ok(EnrichOutcome::Deferred);
    }

    for (field, value) in resolved {
        copy_nonblank(placement, field, &value);
    }
    Ok(EnrichOutcome::Complete)
}
