//! Signing-key cache for the identity provider's published key set.
//!
//! # Cache policy
//!
//! - Populate on miss: an unknown `kid` triggers exactly one refresh of the
//!   full key set before the lookup fails.
//! - Keys are never evicted. A refresh merges the fetched set into the cache
//!   (last write wins per `kid`), so keys overlapping a provider rotation
//!   stay usable.
//! - Reads never block. Concurrent refreshes are allowed to race; each one
//!   is an idempotent merge, so no lock is held across the fetch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Key-set fetch and lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    /// Network or decode error while fetching the key set.
    #[error("key set fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The key endpoint answered with a non-success status.
    #[error("key set endpoint returned HTTP {0}")]
    Status(u16),

    /// The fetch did not complete within the configured timeout.
    #[error("key set fetch timed out")]
    Timeout,

    /// The `kid` is not present even after a refresh.
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),
}

/// Where the cache gets the provider's key set from.
#[async_trait::async_trait]
pub trait KeySetSource: Send + Sync + 'static {
    /// Fetch the complete current key set.
    async fn fetch(&self) -> std::result::Result<JwkSet, KeyFetchError>;
}

/// Fetches the key set from the provider's well-known JWKS endpoint.
pub struct HttpKeySetSource {
    http: reqwest::Client,
    uri: String,
}

impl HttpKeySetSource {
    /// Build a source for `uri` with a bounded request time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `uri` is not HTTPS or the HTTP client
    /// cannot be built.
    pub fn new(uri: impl Into<String>, timeout: Duration) -> Result<Self> {
        let uri = uri.into();
        if !uri.starts_with("https://") {
            return Err(Error::Config(format!("JWKS URI must use https: {uri}")));
        }
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build JWKS client: {e}")))?;
        Ok(Self { http, uri })
    }

    /// The endpoint this source fetches from.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait::async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> std::result::Result<JwkSet, KeyFetchError> {
        debug!(uri = %self.uri, "Fetching JWKS");
        let response = self.http.get(&self.uri).send().await.map_err(timeout_aware)?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Status(status.as_u16()));
        }
        response.json().await.map_err(timeout_aware)
    }
}

fn timeout_aware(e: reqwest::Error) -> KeyFetchError {
    if e.is_timeout() {
        KeyFetchError::Timeout
    } else {
        KeyFetchError::Http(e)
    }
}

/// Process-lifetime cache of decoding keys, indexed by `kid`.
pub struct KeyCache {
    keys: DashMap<String, DecodingKey>,
    source: Arc<dyn KeySetSource>,
    refreshes: AtomicU64,
}

impl KeyCache {
    /// Create an empty cache backed by `source`.
    #[must_use]
    pub fn new(source: Arc<dyn KeySetSource>) -> Self {
        Self {
            keys: DashMap::new(),
            source,
            refreshes: AtomicU64::new(0),
        }
    }

    /// Resolve the decoding key for `kid`, refreshing once on a miss.
    pub async fn resolve(&self, kid: &str) -> std::result::Result<DecodingKey, KeyFetchError> {
        if let Some(key) = self.keys.get(kid) {
            return Ok(key.value().clone());
        }

        debug!(kid = %kid, "Key not cached, refreshing key set");
        self.refresh().await?;

        self.keys
            .get(kid)
            .map(|key| key.value().clone())
            .ok_or_else(|| KeyFetchError::UnknownKeyId(kid.to_string()))
    }

    /// Fetch the key set and merge it into the cache.
    ///
    /// Returns the number of usable keys in the fetched set.
    pub async fn refresh(&self) -> std::result::Result<usize, KeyFetchError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let set = self.source.fetch().await?;

        let mut loaded = 0;
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping JWK without kid");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            match decoding_key(jwk) {
                Some(key) => {
                    self.keys.insert(kid, key);
                    loaded += 1;
                }
                None => warn!(kid = %kid, "Ignoring unusable JWK"),
            }
        }
        debug!(loaded, cached = self.keys.len(), "Key set refreshed");
        Ok(loaded)
    }

    /// Best-effort prefetch; a failure is logged and otherwise ignored.
    pub async fn warm(&self) {
        match self.refresh().await {
            Ok(loaded) => debug!(loaded, "Signing keys prefetched"),
            Err(e) => warn!(error = %e, "Signing key prefetch failed; keys load on first use"),
        }
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of key-set refreshes attempted so far.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

/// Convert an asymmetric JWK into a decoding key.
///
/// Symmetric (`oct`) keys are refused: a published secret key would let
/// anyone mint tokens.
fn decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x).ok(),
        AlgorithmParameters::OctetKey(_) => None,
    }
}
