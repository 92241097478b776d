//! Downstream REST sync
//!
//! Person-derived records patch the contact-details resource; reference
//! data records are pushed to their fixed URL segment. A 422 response is a
//! soft validation rejection: the receiver accepted the record as invalid,
//! so it is logged and not retried. Any other non-2xx
//! propagates; redelivery is the inbound queue's concern.

use crate::model::{ChangeRecord, EntityKind, Operation};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while syncing a record downstream.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("downstream returned {status} for {url}")]
    Status { status: u16, url: String },

    /// A wiring defect: the record's table has no downstream route.
    #[error("no sync route for table {0}")]
    UnmappedTable(EntityKind),
}

/// URL segment for each reference-data table. Tables outside this map have
/// no REST sync route.
fn reference_segment(entity: EntityKind) -> Option<&'static str> {
    match entity {
        EntityKind::Curriculum => Some("curriculum"),
        EntityKind::LocalOffice => Some("local-office"),
        EntityKind::Dbc => Some("dbc"),
        EntityKind::Trust => Some("trust"),
        EntityKind::Site => Some("site"),
        _ => None,
    }
}

/// Client for the downstream reference/contact-details API.
pub struct ReferenceSyncClient {
    base_url: String,
    client: reqwest::Client,
}

impl ReferenceSyncClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// The method and URL a record syncs with. Person records always
    /// PATCH contact details; reference tables map operation to method.
    fn endpoint(&self, record: &ChangeRecord) -> Result<(Method, String), SyncError> {
        if record.entity == EntityKind::Person {
            return Ok((
                Method::PATCH,
                format!("{}/api/contact-details/{}", self.base_url, record.key),
            ));
        }

        let segment =
            reference_segment(record.entity).ok_or(SyncError::UnmappedTable(record.entity))?;
        let endpoint = match record.operation {
            Operation::Insert | Operation::Load | Operation::Lookup => (
                Method::POST,
                format!("{}/api/{}", self.base_url, segment),
            ),
            Operation::Update => (
                Method::PUT,
                format!("{}/api/{}", self.base_url, segment),
            ),
            Operation::Delete => (
                Method::DELETE,
                format!("{}/api/{}/{}", self.base_url, segment, record.key),
            ),
        };
        Ok(endpoint)
    }

    /// Push one record downstream.
    pub async fn sync(&self, record: &ChangeRecord) -> Result<(), SyncError> {
        let (method, url) = self.endpoint(record)?;

        let mut request = self.client.request(method.clone(), &url);
        if method != Method::DELETE {
            request = request.json(&record.fields);
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            info!(entity = %record.entity, key = %record.key, %url, "synced downstream");
            return Ok(());
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            warn!(entity = %record.entity, key = %record.key, %url,
                  "accepted as invalid by receiver, not retrying");
            return Ok(());
        }
        Err(SyncError::Status {
            status: status.as_u16(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;

    fn client() -> ReferenceSyncClient {
        ReferenceSyncClient::new("http://reference.local/")
    }

    fn with_operation(mut r: ChangeRecord, operation: Operation) -> ChangeRecord {
        r.operation = operation;
        r
    }

    #[test]
    fn person_records_patch_contact_details() {
        let person = record(EntityKind::Person, "88", &[("email", "a@b.c")]);
        let (method, url) = client().endpoint(&person).unwrap();
        assert_eq!(method, Method::PATCH);
        assert_eq!(url, "http://reference.local/api/contact-details/88");
    }

    #[test]
    fn reference_tables_map_operation_to_method() {
        let c = client();

        let insert = with_operation(
            record(EntityKind::Curriculum, "C1", &[]),
            Operation::Insert,
        );
        let (method, url) = c.endpoint(&insert).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url, "http://reference.local/api/curriculum");

        let update = with_operation(
            record(EntityKind::LocalOffice, "LO1", &[]),
            Operation::Update,
        );
        let (method, url) = c.endpoint(&update).unwrap();
        assert_eq!(method, Method::PUT);
        assert_eq!(url, "http://reference.local/api/local-office");

        let delete = with_operation(record(EntityKind::Dbc, "D1", &[]), Operation::Delete);
        let (method, url) = c.endpoint(&delete).unwrap();
        assert_eq!(method, Method::DELETE);
        assert_eq!(url, "http://reference.local/api/dbc/D1");
    }

    #[test]
    fn unmapped_table_fails_fast() {
        let placement = record(EntityKind::Placement, "PL1", &[]);
        let result = client().endpoint(&placement);
        assert!(matches!(
            result,
            Err(SyncError::UnmappedTable(EntityKind::Placement))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let c = ReferenceSyncClient::new("http://reference.local///");
        let person = record(EntityKind::Person, "1", &[]);
        let (_, url) = c.endpoint(&person).unwrap();
        assert_eq!(url, "http://reference.local/api/contact-details/1");
    }
}
