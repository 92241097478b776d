//! ChangeRecord: the unit of work flowing through the relay

use super::entity::{EntityKind, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while admitting an inbound change notification.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed change record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("change record for {0} carries no id field")]
    MissingId(EntityKind),

    #[error("change record for {0} carries a non-UUID key: {1}")]
    MalformedKey(EntityKind, String),
}

/// A single observed mutation, as admitted at the wire boundary.
///
/// `fields` mirrors the source system's column set as an untyped string map;
/// the relay only ever does field-name lookups against it. The map is a
/// `BTreeMap` so serialized output is deterministic; aggregation depends on
/// re-runs producing byte-identical records.
///
/// `key` always equals `fields["id"]`. It is immutable once assigned, except
/// when an aggregate promotes the record to a composite key, which rewrites
/// both together via [`ChangeRecord::promote_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub schema: String,
    #[serde(rename = "table")]
    pub entity: EntityKind,
    pub operation: Operation,
    #[serde(rename = "data")]
    pub fields: BTreeMap<String, String>,
    #[serde(skip)]
    pub key: String,
}

impl ChangeRecord {
    /// Build a record, seeding `fields["id"]` from the key.
    pub fn new(
        schema: impl Into<String>,
        entity: EntityKind,
        operation: Operation,
        key: impl Into<String>,
        mut fields: BTreeMap<String, String>,
    ) -> Self {
        let key = key.into();
        fields.insert("id".to_string(), key.clone());
        Self {
            schema: schema.into(),
            entity,
            operation,
            fields,
            key,
        }
    }

    /// Admit one inbound change notification from its JSON wire form.
    ///
    /// Table and operation are validated by the closed enums; the id field
    /// must be present and non-blank. Programme-membership keys are UUIDs
    /// and are validated here so a bad key fails at the edge. Composite
    /// ids (comma-joined strings) are accepted verbatim.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let mut record: ChangeRecord = serde_json::from_str(json)?;
        let key = record
            .fields
            .get("id")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(RecordError::MissingId(record.entity))?;
        if record.entity == EntityKind::ProgrammeMembership && Uuid::parse_str(key).is_err() {
            return Err(RecordError::MalformedKey(record.entity, key.to_string()));
        }
        record.key = key.to_string();
        Ok(record)
    }

    /// Field lookup by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Field lookup that treats blank values as absent.
    pub fn field_nonblank(&self, name: &str) -> Option<&str> {
        self.field(name).map(str::trim).filter(|s| !s.is_empty())
    }

    /// Set a field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style field setter, used mostly by tests and fixtures.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Rewrite the key to an aggregate's composite key, keeping
    /// `fields["id"]` in sync.
    pub fn promote_key(&mut self, composite: impl Into<String>) {
        let composite = composite.into();
        self.fields.insert("id".to_string(), composite.clone());
        self.key = composite;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(json: &str) -> Result<ChangeRecord, RecordError> {
        ChangeRecord::from_json(json)
    }

    #[test]
    fn admits_well_formed_notification() {
        let record = inbound(
            r#"{"schema":"tcs","table":"Trust","operation":"update","data":{"id":"T1","name":"Mercia"}}"#,
        )
        .unwrap();
        assert_eq!(record.entity, EntityKind::Trust);
        assert_eq!(record.operation, Operation::Update);
        assert_eq!(record.key, "T1");
        assert_eq!(record.field("name"), Some("Mercia"));
    }

    #[test]
    fn rejects_unknown_table() {
        let result = inbound(
            r#"{"schema":"tcs","table":"Rotation","operation":"update","data":{"id":"1"}}"#,
        );
        assert!(matches!(result, Err(RecordError::Malformed(_))));
    }

    #[test]
    fn rejects_missing_or_blank_id() {
        let missing = inbound(
            r#"{"schema":"tcs","table":"Trust","operation":"update","data":{"name":"x"}}"#,
        );
        assert!(matches!(missing, Err(RecordError::MissingId(EntityKind::Trust))));

        let blank = inbound(
            r#"{"schema":"tcs","table":"Trust","operation":"update","data":{"id":"  "}}"#,
        );
        assert!(matches!(blank, Err(RecordError::MissingId(_))));
    }

    #[test]
    fn programme_membership_keys_must_be_uuids() {
        let bad = inbound(
            r#"{"schema":"tcs","table":"ProgrammeMembership","operation":"load","data":{"id":"12345"}}"#,
        );
        assert!(matches!(bad, Err(RecordError::MalformedKey(EntityKind::ProgrammeMembership, _))));

        let good = inbound(
            r#"{"schema":"tcs","table":"ProgrammeMembership","operation":"load","data":{"id":"1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed"}}"#,
        );
        assert!(good.is_ok());
    }

    #[test]
    fn accepts_composite_id_verbatim() {
        let record = inbound(
            r#"{"schema":"tcs","table":"CurriculumMembership","operation":"load","data":{"id":"10,11"}}"#,
        )
        .unwrap();
        assert_eq!(record.key, "10,11");
    }

    #[test]
    fn field_nonblank_filters_whitespace() {
        let record = ChangeRecord::new("tcs", EntityKind::Post, Operation::Load, "P1", BTreeMap::new())
            .with_field("trainingBodyId", "  ");
        assert_eq!(record.field("trainingBodyId"), Some("  "));
        assert_eq!(record.field_nonblank("trainingBodyId"), None);
    }

    #[test]
    fn promote_key_keeps_id_field_in_sync() {
        let mut record = ChangeRecord::new(
            "tcs",
            EntityKind::CurriculumMembership,
            Operation::Load,
            "11",
            BTreeMap::new(),
        );
        record.promote_key("10,11");
        assert_eq!(record.key, "10,11");
        assert_eq!(record.field("id"), Some("10,11"));
    }

    #[test]
    fn serialized_fields_are_deterministic() {
        let a = ChangeRecord::new("tcs", EntityKind::Site, Operation::Load, "S1", BTreeMap::new())
            .with_field("name", "Royal Infirmary")
            .with_field("location", "Ward 3");
        let b = ChangeRecord::new("tcs", EntityKind::Site, Operation::Load, "S1", BTreeMap::new())
            .with_field("location", "Ward 3")
            .with_field("name", "Royal Infirmary");
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
