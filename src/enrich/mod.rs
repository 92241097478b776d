//! Enrichment engine: copying reference fields into dependent records
//!
//! One routine per trigger → dependent relationship. A routine pulls every
//! reference it needs through the resolver; if any required reference is
//! not yet locally available the whole dependent is deferred: nothing is
//! emitted now, and the dependent is retried when the missing entity
//! arrives and re-triggers the same path.

mod placement;
mod programme;

pub use placement::enrich_placement;
pub use programme::{copy_programme_fields, enrich_programme, enrich_programme_membership};

use crate::model::{ChangeRecord, EntityKind};
use crate::resolver::{ReferenceResolver, Resolution, ResolveError};

/// Outcome of one enrichment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Every required reference resolved; fields were copied in.
    Complete,
    /// At least one reference is missing; fetches are in flight and the
    /// dependent must not be emitted yet.
    Deferred,
}

/// A reference lookup, folded into the three cases enrichment cares about.
#[derive(Debug, Clone)]
pub(crate) enum RefLookup {
    /// The referenced record is locally held.
    Found(ChangeRecord),
    /// The reference id itself is null/blank: an optional relation, which
    /// resolves to empty values rather than deferring.
    Empty,
    /// Missing locally; a fetch was issued or is already in flight.
    Missing,
}

impl RefLookup {
    /// The referenced record's field value, or `None` when the lookup must
    /// defer. `Empty` yields an empty string.
    pub(crate) fn field(&self, name: &str) -> Option<String> {
        match self {
            RefLookup::Found(record) => {
                Some(record.field(name).unwrap_or_default().to_string())
            }
            RefLookup::Empty => Some(String::new()),
            RefLookup::Missing => None,
        }
    }

    pub(crate) fn is_missing(&self) -> bool {
        matches!(self, RefLookup::Missing)
    }
}

/// Resolve an optional reference id.
pub(crate) async fn resolve_reference(
    resolver: &ReferenceResolver,
    entity: EntityKind,
    id: Option<&str>,
) -> Result<RefLookup, ResolveError> {
    let Some(id) = id.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(RefLookup::Empty);
    };
    match resolver.resolve(entity, id).await? {
        Resolution::Found(record) => Ok(RefLookup::Found(record)),
        Resolution::Requested | Resolution::AlreadyRequested => Ok(RefLookup::Missing),
    }
}

/// Copy a resolved value into the dependent. Only non-blank values
/// overwrite; a blank resolution leaves whatever the record already holds.
pub(crate) fn copy_nonblank(record: &mut ChangeRecord, field: &str, value: &str) {
    if !value.trim().is_empty() {
        record.set_field(field, value);
    }
}
