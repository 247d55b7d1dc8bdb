//! Temporary credential issuance against an access grant.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{self, AuditEvent};
use crate::clock::Clock;
use crate::config::Config;
use crate::federation::{FederationService, SessionRequest};
use crate::identity::IdentityClaim;
use crate::lifecycle::normalize_resource;
use crate::store::{GrantStore, bounded};
use crate::{Error, Result};

/// STS limit on `RoleSessionName`.
const MAX_SESSION_NAME_LEN: usize = 64;

/// Credentials handed to the caller. Never persisted.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredential {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// Credential expiry
    pub expiration: DateTime<Utc>,
    /// Region the credentials are meant for
    pub region: String,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .field("region", &self.region)
            .finish()
    }
}

/// Issuance settings.
#[derive(Debug, Clone)]
pub struct IssuerSettings {
    /// Region returned with every credential
    pub region: String,
    /// Session lifetime requested from the federation service
    pub session_duration: Duration,
    /// Session name prefix
    pub session_name_prefix: String,
    /// Bound on the federation call
    pub federation_timeout: Duration,
    /// Bound on the grant lookup
    pub store_timeout: Duration,
}

impl From<&Config> for IssuerSettings {
    fn from(config: &Config) -> Self {
        Self {
            region: config.federation.region.clone(),
            session_duration: config.federation.session_duration,
            session_name_prefix: config.federation.session_name_prefix.clone(),
            federation_timeout: config.federation.timeout,
            store_timeout: config.store.timeout,
        }
    }
}

/// Exchanges a valid grant for scoped temporary credentials.
pub struct CredentialIssuer {
    grants: Arc<dyn GrantStore>,
    federation: Arc<dyn FederationService>,
    clock: Arc<dyn Clock>,
    settings: IssuerSettings,
}

impl CredentialIssuer {
    /// Create an issuer.
    #[must_use]
    pub fn new(
        grants: Arc<dyn GrantStore>,
        federation: Arc<dyn FederationService>,
        clock: Arc<dyn Clock>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            grants,
            federation,
            clock,
            settings,
        }
    }

    /// Issue credentials for `resource` to the holder of `claim`.
    ///
    /// Expiry is evaluated at read time; an expired grant is left in place.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty or malformed resource
    /// - [`Error::NoGrant`] if no grant exists for the pair
    /// - [`Error::GrantExpired`] if the grant expiry has passed
    /// - [`Error::StoreUnavailable`] if the grant cannot be read
    /// - [`Error::IssuanceFailed`] if the federation call fails or times out
    pub async fn issue(&self, claim: &IdentityClaim, resource: &str) -> Result<IssuedCredential> {
        let resource = normalize_resource(resource)?;
        let subject = claim.subject.as_str();

        let grant = bounded(
            self.settings.store_timeout,
            "get grant",
            self.grants.get(subject, &resource),
        )
        .await?;
        let Some(grant) = grant else {
            audit::emit(&AuditEvent::credential_denied(subject, &resource, "no grant"));
            return Err(Error::NoGrant);
        };
        if grant.is_expired_at(self.clock.now()) {
            audit::emit(&AuditEvent::credential_denied(
                subject,
                &resource,
                "grant expired",
            ));
            return Err(Error::GrantExpired);
        }

        let request = SessionRequest {
            role_ref: grant.role_ref.clone(),
            session_name: session_name(&self.settings.session_name_prefix, subject, &resource),
            duration: self.settings.session_duration,
        };

        let session = match tokio::time::timeout(
            self.settings.federation_timeout,
            self.federation.assume_role(&request),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(self.issuance_failed(subject, &resource, e.to_string())),
            Err(_) => {
                return Err(self.issuance_failed(
                    subject,
                    &resource,
                    format!(
                        "federation call timed out after {}ms",
                        self.settings.federation_timeout.as_millis()
                    ),
                ));
            }
        };

        info!(
            subject = %subject,
            resource = %resource,
            role = %grant.role_ref,
            expiration = %session.expiration,
            "Temporary credentials issued"
        );
        audit::emit(&AuditEvent::credential_issued(
            subject,
            &resource,
            session.expiration,
        ));

        Ok(IssuedCredential {
            access_key_id: session.access_key_id,
            secret_access_key: session.secret_access_key,
            session_token: session.session_token,
            expiration: session.expiration,
            region: self.settings.region.clone(),
        })
    }

    fn issuance_failed(&self, subject: &str, resource: &str, reason: String) -> Error {
        warn!(subject = %subject, resource = %resource, error = %reason, "Credential issuance failed");
        audit::emit(&AuditEvent::credential_denied(subject, resource, &reason));
        Error::IssuanceFailed(reason)
    }
}

/// `<prefix>-<subject>-<resource>`, restricted to the characters STS
/// accepts in a session name and cut to its length limit.
#[must_use]
pub fn session_name(prefix: &str, subject: &str, resource: &str) -> String {
    format!("{prefix}-{subject}-{resource}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_+=,.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SESSION_NAME_LEN)
        .collect()
}
