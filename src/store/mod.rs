//! Durable state: access requests and access grants.
//!
//! Both stores sit behind traits so the lifecycle and issuer can run over
//! the in-memory maps in tests and DynamoDB in production. Field names on
//! the wire match the existing tables (`requestId`, `userId`, `bucket`...).

pub mod dynamodb;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

pub use dynamodb::{DynamoGrantStore, DynamoRequestStore};
pub use memory::{InMemoryGrantStore, InMemoryRequestStore};

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An insert collided with an existing record.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

/// Access request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Awaiting an administrative decision
    Pending,
    /// Approved; a grant exists
    Approved,
    /// Denied
    Denied,
}

impl RequestStatus {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's request for time-limited access to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    /// Unique id (UUID v4)
    #[serde(rename = "requestId")]
    pub id: String,
    /// Requester subject id
    #[serde(rename = "userId")]
    pub requester: String,
    /// Resource identifier
    #[serde(rename = "bucket")]
    pub resource: String,
    /// Free-text justification
    #[serde(rename = "reason")]
    pub justification: String,
    /// Requested duration in hours
    pub duration_hours: f64,
    /// Current status
    pub status: RequestStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Deciding administrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// Decision time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

/// A time-limited right to obtain credentials for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    /// Grantee subject id
    #[serde(rename = "userId")]
    pub subject: String,
    /// Resource identifier
    #[serde(rename = "bucket")]
    pub resource: String,
    /// Trust role assumed at issuance
    #[serde(rename = "roleArn")]
    pub role_ref: String,
    /// Expiry; issuance fails at or after this instant
    pub expires_at: DateTime<Utc>,
    /// Approving request
    #[serde(default)]
    pub request_id: String,
    /// When the grant was written; absent on rows from older writers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,
}

impl AccessGrant {
    /// Whether the grant has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields written by a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status
    pub status: RequestStatus,
    /// Deciding administrator (`None` clears it)
    pub decided_by: Option<String>,
    /// Decision time (`None` clears it)
    pub decided_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// An administrative decision by `admin` at `at`.
    #[must_use]
    pub fn decision(status: RequestStatus, admin: &str, at: DateTime<Utc>) -> Self {
        Self {
            status,
            decided_by: Some(admin.to_string()),
            decided_at: Some(at),
        }
    }

    /// Back to `pending` with the decision fields cleared.
    #[must_use]
    pub fn revert() -> Self {
        Self {
            status: RequestStatus::Pending,
            decided_by: None,
            decided_at: None,
        }
    }
}

/// Outcome of a conditional status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The record was in the expected state and has been updated.
    Applied(AccessRequest),
    /// The record exists but is in a different state.
    Conflict(RequestStatus),
    /// No record with that id.
    Missing,
}

/// Access request persistence.
#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    /// Persist a new request. Fails with [`StoreError::Duplicate`] if the id
    /// already exists.
    async fn insert(&self, request: &AccessRequest) -> Result<(), StoreError>;

    /// Point lookup by id.
    async fn get(&self, id: &str) -> Result<Option<AccessRequest>, StoreError>;

    /// Atomically apply `update` if the record is currently `expected`.
    async fn transition(
        &self,
        id: &str,
        expected: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Transition, StoreError>;

    /// All requests with `status`, in no particular order.
    async fn list_by_status(&self, status: RequestStatus)
    -> Result<Vec<AccessRequest>, StoreError>;
}

/// Access grant persistence, keyed by (subject, resource).
#[async_trait]
pub trait GrantStore: Send + Sync + 'static {
    /// Point lookup.
    async fn get(&self, subject: &str, resource: &str) -> Result<Option<AccessGrant>, StoreError>;

    /// Insert or replace the grant for its (subject, resource) pair.
    async fn upsert(&self, grant: &AccessGrant) -> Result<(), StoreError>;
}

/// Run a store call under `limit`, mapping both failure and timeout to
/// [`Error::StoreUnavailable`].
pub(crate) async fn bounded<T, F>(limit: Duration, op: &str, fut: F) -> crate::Result<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::StoreUnavailable(format!("{op}: {e}"))),
        Err(_) => Err(Error::StoreUnavailable(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_uses_table_field_names() {
        // GIVEN: a pending request
        let request = AccessRequest {
            id: "r1".to_string(),
            requester: "u1".to_string(),
            resource: "reports".to_string(),
            justification: "quarterly audit".to_string(),
            duration_hours: 4.0,
            status: RequestStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            decided_by: None,
            decided_at: None,
        };

        // WHEN: serializing
        let json = serde_json::to_value(&request).unwrap();

        // THEN: names match the existing tables and decision fields are omitted
        assert_eq!(
            json,
            serde_json::json!({
                "requestId": "r1",
                "userId": "u1",
                "bucket": "reports",
                "reason": "quarterly audit",
                "durationHours": 4.0,
                "status": "pending",
                "createdAt": "2024-01-01T00:00:00Z"
            })
        );
    }

    #[test]
    fn grant_expiry_is_inclusive() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let grant = AccessGrant {
            subject: "u1".to_string(),
            resource: "reports".to_string(),
            role_ref: "arn:aws:iam::1:role/r".to_string(),
            expires_at: at,
            request_id: "r1".to_string(),
            granted_at: Some(at - chrono::Duration::hours(2)),
        };
        assert!(!grant.is_expired_at(at - chrono::Duration::seconds(1)));
        assert!(grant.is_expired_at(at));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Denied,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("APPROVED"), None);
    }

    #[tokio::test]
    async fn bounded_maps_timeout_to_store_unavailable() {
        // GIVEN: a store call that never completes
        let never = std::future::pending::<Result<(), StoreError>>();

        // WHEN: bounding it
        let result = bounded(Duration::from_millis(10), "get", never).await;

        // THEN: reported as StoreUnavailable
        assert!(matches!(result, Err(Error::StoreUnavailable(m)) if m.contains("timed out")));
    }
}
