//! Entity-type and operation registries

use serde::{Deserialize, Serialize};

/// The closed set of entity tables the relay observes.
///
/// Serialized form is the wire table name (`"ProgrammeMembership"` etc.).
/// Deserializing any other table name is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Trust,
    Site,
    Post,
    PostSpecialty,
    Placement,
    PlacementSite,
    PlacementSpecialty,
    Programme,
    ProgrammeMembership,
    CurriculumMembership,
    ConditionsOfJoining,
    Curriculum,
    LocalOffice,
    Dbc,
    Person,
}

impl EntityKind {
    /// Every kind, in registry order. Used by the CLI inspect command.
    pub const ALL: [EntityKind; 15] = [
        EntityKind::Trust,
        EntityKind::Site,
        EntityKind::Post,
        EntityKind::PostSpecialty,
        EntityKind::Placement,
        EntityKind::PlacementSite,
        EntityKind::PlacementSpecialty,
        EntityKind::Programme,
        EntityKind::ProgrammeMembership,
        EntityKind::CurriculumMembership,
        EntityKind::ConditionsOfJoining,
        EntityKind::Curriculum,
        EntityKind::LocalOffice,
        EntityKind::Dbc,
        EntityKind::Person,
    ];

    /// The wire table name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Trust => "Trust",
            EntityKind::Site => "Site",
            EntityKind::Post => "Post",
            EntityKind::PostSpecialty => "PostSpecialty",
            EntityKind::Placement => "Placement",
            EntityKind::PlacementSite => "PlacementSite",
            EntityKind::PlacementSpecialty => "PlacementSpecialty",
            EntityKind::Programme => "Programme",
            EntityKind::ProgrammeMembership => "ProgrammeMembership",
            EntityKind::CurriculumMembership => "CurriculumMembership",
            EntityKind::ConditionsOfJoining => "ConditionsOfJoining",
            EntityKind::Curriculum => "Curriculum",
            EntityKind::LocalOffice => "LocalOffice",
            EntityKind::Dbc => "Dbc",
            EntityKind::Person => "Person",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// Lifecycle operation carried by an inbound change notification.
///
/// `Load` is a bulk-refresh upsert, `Lookup` is a cache probe that must not
/// re-persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Load,
    Delete,
    Lookup,
}

impl Operation {
    /// True for the operations that write the record into the local store.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update | Operation::Load)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Load => "load",
            Operation::Delete => "delete",
            Operation::Lookup => "lookup",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_round_trips_through_table_name() {
        for kind in EntityKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.table()));
            let back: EntityKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn unknown_table_rejected_at_boundary() {
        let result: Result<EntityKind, _> = serde_json::from_str("\"Rotation\"");
        assert!(result.is_err());
    }

    #[test]
    fn operation_parses_lowercase_wire_form() {
        let op: Operation = serde_json::from_str("\"load\"").unwrap();
        assert_eq!(op, Operation::Load);
        assert!(op.is_upsert());
        assert!(!Operation::Delete.is_upsert());
    }

    #[test]
    fn unknown_operation_rejected_at_boundary() {
        let result: Result<Operation, _> = serde_json::from_str("\"truncate\"");
        assert!(result.is_err());
    }
}
