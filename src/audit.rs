//! Audit logging for access request and credential lifecycle events.
//!
//! Every event is emitted via `tracing::info!` as one JSON blob in the
//! `audit` field, so the trail can be extracted by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `request.submitted` | A requester created a pending access request |
//! | `request.approved` | An admin approved a request and the grant was written |
//! | `request.denied` | An admin denied a request |
//! | `request.rolled_back` | Grant write failed; the approval was reverted to pending |
//! | `approval.inconsistent` | Grant write and rollback both failed |
//! | `credential.issued` | Scoped credentials were minted for a grant |
//! | `credential.denied` | Issuance refused (no grant, expired, federation failure) |
//! | `auth.denied` | Bearer verification or role check failed |

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{AccessGrant, AccessRequest};

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"request.approved"`).
    pub event: &'static str,
    /// Subject the event is about (requester or credential holder).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Administrator who acted, for decisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Affected access request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Affected resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Grant or credential expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Human-readable reason for denial or failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            actor: None,
            request_id: None,
            resource: None,
            expires_at: None,
            reason: None,
        }
    }

    fn for_request(event: &'static str, request: &AccessRequest) -> Self {
        Self {
            subject: Some(request.requester.clone()),
            request_id: Some(request.id.clone()),
            resource: Some(request.resource.clone()),
            ..Self::new(event)
        }
    }

    /// Construct a `request.submitted` event.
    #[must_use]
    pub fn submitted(request: &AccessRequest) -> Self {
        Self::for_request("request.submitted", request)
    }

    /// Construct a `request.approved` event.
    #[must_use]
    pub fn approved(request: &AccessRequest, admin: &str, grant: &AccessGrant) -> Self {
        Self {
            actor: Some(admin.to_string()),
            expires_at: Some(grant.expires_at),
            ..Self::for_request("request.approved", request)
        }
    }

    /// Construct a `request.denied` event.
    #[must_use]
    pub fn denied(request: &AccessRequest, admin: &str) -> Self {
        Self {
            actor: Some(admin.to_string()),
            ..Self::for_request("request.denied", request)
        }
    }

    /// Construct a `request.rolled_back` event.
    #[must_use]
    pub fn rolled_back(request: &AccessRequest, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::for_request("request.rolled_back", request)
        }
    }

    /// Construct an `approval.inconsistent` event.
    #[must_use]
    pub fn inconsistent(request: &AccessRequest, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::for_request("approval.inconsistent", request)
        }
    }

    /// Construct a `credential.issued` event.
    #[must_use]
    pub fn credential_issued(subject: &str, resource: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            subject: Some(subject.to_string()),
            resource: Some(resource.to_string()),
            expires_at: Some(expires_at),
            ..Self::new("credential.issued")
        }
    }

    /// Construct a `credential.denied` event.
    #[must_use]
    pub fn credential_denied(subject: &str, resource: &str, reason: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.to_string()),
            resource: Some(resource.to_string()),
            reason: Some(reason.into()),
            ..Self::new("credential.denied")
        }
    }

    /// Construct an `auth.denied` event.
    #[must_use]
    pub fn auth_denied(subject: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.map(str::to_string),
            reason: Some(reason.into()),
            ..Self::new("auth.denied")
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO access_broker::audit audit={"event":"request.approved",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "access audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
