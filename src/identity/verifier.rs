//! Bearer token verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Refuse symmetric and `none` algorithms outright.
//! 3. Resolve the decoding key through the [`KeyCache`] (one refresh on an
//!    unknown `kid`).
//! 4. Verify signature, `iss`, `aud` and `exp` (with clock leeway).
//! 5. Optionally check `token_use`, then extract subject and groups.
//!
//! Every failure is reported as [`Error::Unauthenticated`]; the reason is
//! kept in the message for logs but never returned to callers verbatim.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, TokenData, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use super::claims::IdentityClaim;
use super::keys::KeyCache;
use crate::config::IdentityConfig;
use crate::{Error, Result};

/// What a token must assert to be accepted.
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Expected `iss`.
    pub issuer: String,
    /// Expected `aud` (the app client id).
    pub audience: String,
    /// Claim carrying group memberships.
    pub groups_claim: String,
    /// Required `token_use`, if any.
    pub token_use: Option<String>,
    /// Clock skew tolerance in seconds.
    pub leeway_secs: u64,
}

impl From<&IdentityConfig> for VerifierSettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            issuer: config.resolved_issuer(),
            audience: config.client_id.clone(),
            groups_claim: config.groups_claim.clone(),
            token_use: config.token_use.clone(),
            leeway_secs: config.leeway_secs,
        }
    }
}

/// Verifies bearer tokens against the provider's rotating key set.
pub struct TokenVerifier {
    keys: Arc<KeyCache>,
    settings: VerifierSettings,
}

impl TokenVerifier {
    /// Create a verifier over a shared key cache.
    #[must_use]
    pub fn new(keys: Arc<KeyCache>, settings: VerifierSettings) -> Self {
        Self { keys, settings }
    }

    /// The underlying key cache.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Verify `token` and return the identity it asserts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] if the token is empty, malformed,
    /// signed with an unknown key or an unsupported algorithm, or fails any
    /// issuer, audience, expiry or `token_use` check.
    pub async fn verify(&self, token: &str) -> Result<IdentityClaim> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Unauthenticated("missing bearer token".to_string()));
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::Unauthenticated(format!("malformed token: {e}")))?;
        let alg = accepted_algorithm(header.alg)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::Unauthenticated("token header has no kid".to_string()))?;

        let key = self
            .keys
            .resolve(&kid)
            .await
            .map_err(|e| Error::Unauthenticated(e.to_string()))?;

        let validation = self.validation(alg);
        let data: TokenData<Map<String, Value>> = jsonwebtoken::decode(token, &key, &validation)
            .map_err(|e| Error::Unauthenticated(format!("token rejected: {e}")))?;

        let claim = self.extract(&data.claims)?;
        debug!(subject = %claim.subject, groups = claim.groups.len(), "Token verified");
        Ok(claim)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.set_issuer(&[&self.settings.issuer]);
        v.set_audience(&[&self.settings.audience]);
        v.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        v.validate_exp = true;
        v.validate_nbf = true;
        v.leeway = self.settings.leeway_secs;
        v
    }

    fn extract(&self, claims: &Map<String, Value>) -> Result<IdentityClaim> {
        if let Some(ref expected) = self.settings.token_use {
            let actual = claims.get("token_use").and_then(Value::as_str).unwrap_or("");
            if actual != expected {
                return Err(Error::Unauthenticated(format!(
                    "token_use '{actual}' is not '{expected}'"
                )));
            }
        }

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Unauthenticated("token has no subject".to_string()))?
            .to_string();

        let expires_at = claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(timestamp)
            .ok_or_else(|| Error::Unauthenticated("token has no valid exp".to_string()))?;

        Ok(IdentityClaim {
            subject,
            email: claims
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            groups: extract_groups(claims.get(&self.settings.groups_claim)),
            expires_at,
        })
    }
}

/// Only asymmetric signature algorithms are acceptable for provider tokens.
fn accepted_algorithm(alg: Algorithm) -> Result<Algorithm> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384
        | Algorithm::EdDSA => Ok(alg),
        other => Err(Error::Unauthenticated(format!(
            "unsupported token algorithm {other:?}"
        ))),
    }
}

/// Groups may be published as an array of strings or a single string.
fn extract_groups(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split([',', ' '])
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
