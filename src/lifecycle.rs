//! Access request lifecycle: submission, administrative decision and grant
//! materialization.
//!
//! # State machine
//!
//! ```text
//! pending --approve--> approved
//!    \
//!     `----deny-----> denied
//! ```
//!
//! Both targets are terminal. The transition is a compare-and-set in the
//! store, so of two concurrent decisions on one request exactly one wins.
//!
//! # Approval
//!
//! Approval is two writes: the status transition and the grant upsert. The
//! upsert is retried with exponential backoff; if it still fails, the status
//! is set back to `pending` so no request is left approved without a grant.
//! The sequence runs on its own task and completes even if the caller goes
//! away.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::clock::Clock;
use crate::config::Config;
use crate::identity::{IdentityClaim, require_role};
use crate::store::{
    AccessGrant, AccessRequest, GrantStore, RequestStatus, RequestStore, StatusUpdate, Transition,
    bounded,
};
use crate::trust_roles::TrustRoleResolver;
use crate::{Error, Result};

/// Longest accepted resource identifier, in bytes.
pub const MAX_RESOURCE_LEN: usize = 255;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// An administrator's verdict on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Grant access
    Approve,
    /// Refuse access
    Deny,
}

/// Tunables for the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Group required to list and decide requests
    pub admin_role: String,
    /// Upper bound on requested and approved durations
    pub max_duration_hours: f64,
    /// Upper bound on justification length (characters)
    pub max_justification_len: usize,
    /// Attempts for the grant upsert and for the rollback
    pub grant_write_attempts: usize,
    /// First backoff delay between grant write attempts
    pub retry_delay: Duration,
    /// Per-call store timeout
    pub store_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            admin_role: "admin".to_string(),
            max_duration_hours: 24.0 * 365.0,
            max_justification_len: 2000,
            grant_write_attempts: 3,
            retry_delay: Duration::from_millis(50),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl LifecyclePolicy {
    /// Policy from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            admin_role: config.identity.admin_group.clone(),
            max_duration_hours: config.access.max_duration_hours,
            max_justification_len: config.access.max_justification_len,
            grant_write_attempts: config.access.grant_write_attempts,
            store_timeout: config.store.timeout,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(self.retry_delay * 8)
            .with_max_times(self.grant_write_attempts.saturating_sub(1))
    }
}

/// Orchestrates request creation, decisions and grant writes.
#[derive(Clone)]
pub struct RequestLifecycle {
    requests: Arc<dyn RequestStore>,
    grants: Arc<dyn GrantStore>,
    roles: Arc<TrustRoleResolver>,
    clock: Arc<dyn Clock>,
    policy: Arc<LifecyclePolicy>,
}

impl RequestLifecycle {
    /// Create a lifecycle manager.
    #[must_use]
    pub fn new(
        requests: Arc<dyn RequestStore>,
        grants: Arc<dyn GrantStore>,
        roles: TrustRoleResolver,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            requests,
            grants,
            roles: Arc::new(roles),
            clock,
            policy: Arc::new(policy),
        }
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Create a pending request on behalf of `claim` and return its id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for a bad resource, justification or duration
    /// - [`Error::StoreUnavailable`] if the request cannot be persisted
    pub async fn submit(
        &self,
        claim: &IdentityClaim,
        resource: &str,
        justification: &str,
        duration_hours: f64,
    ) -> Result<String> {
        let resource = normalize_resource(resource)?;
        let duration_hours = self.check_duration(duration_hours)?;
        if justification.chars().count() > self.policy.max_justification_len {
            return Err(Error::InvalidInput(format!(
                "reason must be at most {} characters",
                self.policy.max_justification_len
            )));
        }

        let request = AccessRequest {
            id: Uuid::new_v4().to_string(),
            requester: claim.subject.clone(),
            resource,
            justification: justification.to_string(),
            duration_hours,
            status: RequestStatus::Pending,
            created_at: self.clock.now(),
            decided_by: None,
            decided_at: None,
        };

        bounded(
            self.policy.store_timeout,
            "insert request",
            self.requests.insert(&request),
        )
        .await?;

        info!(
            request_id = %request.id,
            subject = %request.requester,
            resource = %request.resource,
            duration_hours,
            "Access request submitted"
        );
        audit::emit(&AuditEvent::submitted(&request));
        Ok(request.id)
    }

    /// All pending requests. Requires the admin role.
    ///
    /// # Errors
    ///
    /// - [`Error::Forbidden`] without the admin role
    /// - [`Error::StoreUnavailable`] if the store cannot be read
    pub async fn list_pending(&self, claim: &IdentityClaim) -> Result<Vec<AccessRequest>> {
        self.require_admin(claim)?;
        bounded(
            self.policy.store_timeout,
            "list pending",
            self.requests.list_by_status(RequestStatus::Pending),
        )
        .await
    }

    /// Approve or deny a pending request. Returns the updated request.
    ///
    /// `duration_hours` is required for approval and replaces the duration
    /// the requester asked for.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`Error::Forbidden`] without the admin role
    /// - [`Error::NotFound`] for an unknown request id
    /// - [`Error::AlreadyProcessed`] if the request is no longer pending
    /// - [`Error::InvalidInput`] for a missing or bad approval duration
    /// - [`Error::Config`] if the resource has no trust role
    /// - [`Error::StoreUnavailable`] if the store fails; an approval whose
    ///   grant could not be written has been reverted to pending
    pub async fn decide(
        &self,
        claim: &IdentityClaim,
        request_id: &str,
        decision: Decision,
        duration_hours: Option<f64>,
    ) -> Result<AccessRequest> {
        self.require_admin(claim)?;

        let request = bounded(
            self.policy.store_timeout,
            "get request",
            self.requests.get(request_id.trim()),
        )
        .await?
        .ok_or_else(|| Error::NotFound(format!("request '{request_id}'")))?;

        if request.status != RequestStatus::Pending {
            return Err(already_processed(&request.id, request.status));
        }

        match decision {
            Decision::Deny => self.deny(request, &claim.subject).await,
            Decision::Approve => {
                let hours = duration_hours.ok_or_else(|| {
                    Error::InvalidInput("durationHours is required to approve".to_string())
                })?;
                let hours = self.check_duration(hours)?;
                // Resolved before any write: an unmapped resource must not
                // leave a half-applied approval behind.
                let role_ref = self.roles.resolve(&request.resource)?;
                let now = self.clock.now();
                let expires_at = expiry(now, hours)?;

                let this = self.clone();
                let admin = claim.subject.clone();
                tokio::spawn(async move {
                    this.approve(request, admin, role_ref, now, expires_at)
                        .await
                })
                .await
                .map_err(|e| Error::Internal(format!("approval task failed: {e}")))?
            }
        }
    }

    async fn deny(&self, request: AccessRequest, admin: &str) -> Result<AccessRequest> {
        let update = StatusUpdate::decision(RequestStatus::Denied, admin, self.clock.now());
        let denied = self.transition(&request.id, RequestStatus::Pending, update).await?;
        info!(request_id = %denied.id, admin = %admin, "Access request denied");
        audit::emit(&AuditEvent::denied(&denied, admin));
        Ok(denied)
    }

    async fn approve(
        &self,
        request: AccessRequest,
        admin: String,
        role_ref: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<AccessRequest> {
        let update = StatusUpdate::decision(RequestStatus::Approved, &admin, now);
        let approved = self
            .transition(&request.id, RequestStatus::Pending, update)
            .await?;

        let grant = AccessGrant {
            subject: approved.requester.clone(),
            resource: approved.resource.clone(),
            role_ref,
            expires_at,
            request_id: approved.id.clone(),
            granted_at: Some(now),
        };

        match self.write_grant(&grant).await {
            Ok(()) => {
                info!(
                    request_id = %approved.id,
                    admin = %admin,
                    subject = %grant.subject,
                    resource = %grant.resource,
                    expires_at = %grant.expires_at,
                    "Access request approved"
                );
                audit::emit(&AuditEvent::approved(&approved, &admin, &grant));
                Ok(approved)
            }
            Err(e) => {
                self.roll_back(&approved, &e).await;
                Err(Error::StoreUnavailable(format!(
                    "grant write failed for request '{}': {e}",
                    approved.id
                )))
            }
        }
    }

    async fn write_grant(&self, grant: &AccessGrant) -> Result<()> {
        (|| async move {
            bounded(
                self.policy.store_timeout,
                "upsert grant",
                self.grants.upsert(grant),
            )
            .await
        })
        .retry(self.policy.backoff())
        .notify(|e: &Error, delay: Duration| {
            warn!(
                request_id = %grant.request_id,
                delay_ms = delay.as_millis(),
                error = %e,
                "Grant write failed, retrying"
            );
        })
        .await
    }

    /// Compensate a failed grant write by returning the request to pending.
    async fn roll_back(&self, approved: &AccessRequest, cause: &Error) {
        let outcome = (|| async move {
            bounded(
                self.policy.store_timeout,
                "revert approval",
                self.requests
                    .transition(&approved.id, RequestStatus::Approved, StatusUpdate::revert()),
            )
            .await
        })
        .retry(self.policy.backoff())
        .await;

        match outcome {
            Ok(Transition::Applied(_)) => {
                warn!(request_id = %approved.id, error = %cause, "Approval rolled back to pending");
                audit::emit(&AuditEvent::rolled_back(approved, cause.to_string()));
            }
            Ok(other) => {
                error!(
                    request_id = %approved.id,
                    outcome = ?other,
                    "Approval rollback found the request in an unexpected state"
                );
                audit::emit(&AuditEvent::inconsistent(
                    approved,
                    format!("rollback outcome {other:?} after: {cause}"),
                ));
            }
            Err(e) => {
                error!(
                    request_id = %approved.id,
                    error = %e,
                    cause = %cause,
                    "Approval rollback failed; request is approved without a grant"
                );
                audit::emit(&AuditEvent::inconsistent(
                    approved,
                    format!("rollback failed: {e}; after: {cause}"),
                ));
            }
        }
    }

    async fn transition(
        &self,
        id: &str,
        expected: RequestStatus,
        update: StatusUpdate,
    ) -> Result<AccessRequest> {
        let outcome = bounded(
            self.policy.store_timeout,
            "transition request",
            self.requests.transition(id, expected, update),
        )
        .await?;
        match outcome {
            Transition::Applied(request) => Ok(request),
            Transition::Conflict(status) => Err(already_processed(id, status)),
            Transition::Missing => Err(Error::NotFound(format!("request '{id}'"))),
        }
    }

    /// Fail with [`Error::Forbidden`] unless `claim` holds the admin role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without the admin role.
    pub fn require_admin(&self, claim: &IdentityClaim) -> Result<()> {
        require_role(claim, &self.policy.admin_role).inspect_err(|_| {
            audit::emit(&AuditEvent::auth_denied(
                Some(&claim.subject),
                format!("role '{}' required", self.policy.admin_role),
            ));
        })
    }

    fn check_duration(&self, hours: f64) -> Result<f64> {
        if !hours.is_finite() || hours <= 0.0 {
            return Err(Error::InvalidInput(
                "durationHours must be a positive number".to_string(),
            ));
        }
        if (hours * MILLIS_PER_HOUR).round() < 1.0 {
            return Err(Error::InvalidInput(
                "durationHours is shorter than one millisecond".to_string(),
            ));
        }
        if hours > self.policy.max_duration_hours {
            return Err(Error::InvalidInput(format!(
                "durationHours must be at most {}",
                self.policy.max_duration_hours
            )));
        }
        Ok(hours)
    }
}

/// Trim and validate a resource identifier.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the identifier is empty, too long, or
/// contains whitespace or control characters.
pub fn normalize_resource(resource: &str) -> Result<String> {
    let resource = resource.trim();
    if resource.is_empty() {
        return Err(Error::InvalidInput("bucket must not be empty".to_string()));
    }
    if resource.len() > MAX_RESOURCE_LEN {
        return Err(Error::InvalidInput(format!(
            "bucket must be at most {MAX_RESOURCE_LEN} bytes"
        )));
    }
    if resource.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidInput(
            "bucket must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(resource.to_string())
}

fn already_processed(id: &str, status: RequestStatus) -> Error {
    Error::AlreadyProcessed(format!("request '{id}' is already {status}"))
}

#[allow(clippy::cast_possible_truncation)]
fn expiry(now: DateTime<Utc>, hours: f64) -> Result<DateTime<Utc>> {
    let millis = (hours * MILLIS_PER_HOUR).round();
    let overflow = || Error::InvalidInput("durationHours is out of range".to_string());
    // A grant must expire strictly after it is written
    if !millis.is_finite() || millis < 1.0 || millis >= i64::MAX as f64 {
        return Err(overflow());
    }
    let delta = chrono::Duration::try_milliseconds(millis as i64).ok_or_else(overflow)?;
    now.checked_add_signed(delta).ok_or_else(overflow)
}
