//! Shared fixtures for integration tests: signing keys, token minting,
//! counting key sources, fake federation and misbehaving stores.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use access_broker::clock::{Clock, ManualClock};
use access_broker::federation::{FederationError, FederationService, ScopedSession, SessionRequest};
use access_broker::identity::{
    IdentityClaim, KeyCache, KeyFetchError, KeySetSource, TokenVerifier, VerifierSettings,
};
use access_broker::issuer::{CredentialIssuer, IssuerSettings};
use access_broker::lifecycle::{LifecyclePolicy, RequestLifecycle};
use access_broker::store::{
    AccessGrant, AccessRequest, GrantStore, InMemoryGrantStore, InMemoryRequestStore,
    RequestStatus, RequestStore, StatusUpdate, StoreError, Transition,
};
use access_broker::trust_roles::TrustRoleResolver;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};

pub const ISSUER: &str = "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_TestPool";
pub const AUDIENCE: &str = "test-client-id";
pub const REPORTS_ROLE: &str = "arn:aws:iam::123456789012:role/reports-temp-access";

// ── Keys and tokens ────────────────────────────────────────────────────

/// A deterministic Ed25519 signing key with its JWK form.
pub struct TestKey {
    pub kid: String,
    pkcs8: Vec<u8>,
    pub x: String,
}

impl TestKey {
    pub fn new(kid: &str, seed: u8) -> Self {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let x = URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes());
        let mut pkcs8 = vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes
        ];
        pkcs8.extend_from_slice(&signing.to_bytes());
        Self {
            kid: kid.to_string(),
            pkcs8,
            x,
        }
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "alg": "EdDSA",
            "use": "sig",
            "kid": self.kid,
            "x": self.x,
        })
    }

    /// Sign `claims` with this key, naming `kid` in the header.
    pub fn sign_as(&self, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(&self.pkcs8))
            .expect("encode test token")
    }

    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(&self.kid, claims)
    }
}

/// Standard provider claims for `sub`, valid for an hour.
pub fn claims(sub: &str, groups: &[&str]) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": AUDIENCE,
        "iat": now,
        "exp": now + 3600,
        "token_use": "id",
        "email": format!("{sub}@example.com"),
        "cognito:groups": groups,
    })
}

/// Key source that counts fetches and can be re-published mid-test.
pub struct CountingKeySource {
    keys: Mutex<Value>,
    fetches: AtomicUsize,
}

impl CountingKeySource {
    pub fn new(keys: &[&TestKey]) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(Self::set(keys)),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn publish(&self, keys: &[&TestKey]) {
        *self.keys.lock() = Self::set(keys);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn set(keys: &[&TestKey]) -> Value {
        json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
    }
}

#[async_trait]
impl KeySetSource for CountingKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let set = self.keys.lock().clone();
        Ok(serde_json::from_value(set).expect("valid JWKS"))
    }
}

/// Key source whose endpoint is down.
pub struct UnreachableKeySource;

#[async_trait]
impl KeySetSource for UnreachableKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        Err(KeyFetchError::Status(503))
    }
}

pub fn verifier_settings() -> VerifierSettings {
    VerifierSettings {
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        groups_claim: "cognito:groups".to_string(),
        token_use: None,
        leeway_secs: 60,
    }
}

pub fn verifier(source: Arc<dyn KeySetSource>) -> TokenVerifier {
    TokenVerifier::new(Arc::new(KeyCache::new(source)), verifier_settings())
}

// ── Identities ─────────────────────────────────────────────────────────

pub fn identity(subject: &str, groups: &[&str]) -> IdentityClaim {
    IdentityClaim {
        subject: subject.to_string(),
        email: None,
        groups: groups.iter().map(|g| (*g).to_string()).collect(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

pub fn admin() -> IdentityClaim {
    identity("admin-1", &["admin"])
}

pub fn user() -> IdentityClaim {
    identity("user-1", &["analysts"])
}

// ── Federation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationMode {
    Succeed,
    Refuse,
    Hang,
}

/// Records every call and answers according to its mode.
pub struct FakeFederation {
    mode: Mutex<FederationMode>,
    calls: Mutex<Vec<SessionRequest>>,
}

impl FakeFederation {
    pub fn new(mode: FederationMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: FederationMode) {
        *self.mode.lock() = mode;
    }

    pub fn calls(&self) -> Vec<SessionRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FederationService for FakeFederation {
    async fn assume_role(&self, request: &SessionRequest) -> Result<ScopedSession, FederationError> {
        self.calls.lock().push(request.clone());
        let mode = *self.mode.lock();
        match mode {
            FederationMode::Succeed => Ok(ScopedSession {
                access_key_id: "ASIATESTACCESSKEY".to_string(),
                secret_access_key: "test-secret-access-key".to_string(),
                session_token: "test-session-token".to_string(),
                expiration: Utc::now() + chrono::Duration::hours(1),
            }),
            FederationMode::Refuse => Err(FederationError::Rejected {
                status: 403,
                code: "AccessDenied".to_string(),
                message: "trust policy does not allow this principal".to_string(),
            }),
            FederationMode::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ── Misbehaving stores ─────────────────────────────────────────────────

/// Grant store whose first `failures` upserts fail.
pub struct FlakyGrantStore {
    inner: InMemoryGrantStore,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyGrantStore {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryGrantStore::new(),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GrantStore for FlakyGrantStore {
    async fn get(&self, subject: &str, resource: &str) -> Result<Option<AccessGrant>, StoreError> {
        self.inner.get(subject, resource).await
    }

    async fn upsert(&self, grant: &AccessGrant) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("throttled".to_string()));
        }
        self.inner.upsert(grant).await
    }
}

/// Grant store whose writes take `delay` to land.
pub struct SlowGrantStore {
    inner: InMemoryGrantStore,
    delay: Duration,
}

impl SlowGrantStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryGrantStore::new(),
            delay,
        })
    }
}

#[async_trait]
impl GrantStore for SlowGrantStore {
    async fn get(&self, subject: &str, resource: &str) -> Result<Option<AccessGrant>, StoreError> {
        self.inner.get(subject, resource).await
    }

    async fn upsert(&self, grant: &AccessGrant) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(grant).await
    }
}

/// Grant store whose reads never complete.
pub struct HangingGrantStore;

#[async_trait]
impl GrantStore for HangingGrantStore {
    async fn get(&self, _: &str, _: &str) -> Result<Option<AccessGrant>, StoreError> {
        std::future::pending().await
    }

    async fn upsert(&self, _: &AccessGrant) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

/// Request store that refuses to move anything out of `approved`.
pub struct NoRevertRequestStore {
    inner: InMemoryRequestStore,
}

impl NoRevertRequestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRequestStore::new(),
        })
    }
}

#[async_trait]
impl RequestStore for NoRevertRequestStore {
    async fn insert(&self, request: &AccessRequest) -> Result<(), StoreError> {
        self.inner.insert(request).await
    }

    async fn get(&self, id: &str) -> Result<Option<AccessRequest>, StoreError> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: &str,
        expected: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Transition, StoreError> {
        if expected == RequestStatus::Approved {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.transition(id, expected, update).await
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<AccessRequest>, StoreError> {
        self.inner.list_by_status(status).await
    }
}

/// Request store whose calls never complete.
pub struct HangingRequestStore;

#[async_trait]
impl RequestStore for HangingRequestStore {
    async fn insert(&self, _: &AccessRequest) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn get(&self, _: &str) -> Result<Option<AccessRequest>, StoreError> {
        std::future::pending().await
    }

    async fn transition(
        &self,
        _: &str,
        _: RequestStatus,
        _: StatusUpdate,
    ) -> Result<Transition, StoreError> {
        std::future::pending().await
    }

    async fn list_by_status(&self, _: RequestStatus) -> Result<Vec<AccessRequest>, StoreError> {
        std::future::pending().await
    }
}

// ── Harness ────────────────────────────────────────────────────────────

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn test_policy() -> LifecyclePolicy {
    LifecyclePolicy {
        retry_delay: Duration::from_millis(1),
        store_timeout: Duration::from_millis(200),
        ..LifecyclePolicy::default()
    }
}

pub fn issuer_settings() -> IssuerSettings {
    IssuerSettings {
        region: "us-east-1".to_string(),
        session_duration: Duration::from_secs(3600),
        session_name_prefix: "temp-access".to_string(),
        federation_timeout: Duration::from_millis(200),
        store_timeout: Duration::from_millis(200),
    }
}

pub fn trust_roles() -> TrustRoleResolver {
    let mut roles = HashMap::new();
    roles.insert("reports".to_string(), REPORTS_ROLE.to_string());
    roles.insert("logs".to_string(), "arn:aws:iam::123456789012:role/logs".to_string());
    // Empty prefix: no environment fallback in tests
    TrustRoleResolver::new(roles, "")
}

/// Lifecycle and issuer wired over shared stores and a manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub requests: Arc<dyn RequestStore>,
    pub grants: Arc<dyn GrantStore>,
    pub federation: Arc<FakeFederation>,
    pub lifecycle: RequestLifecycle,
    pub issuer: CredentialIssuer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(InMemoryRequestStore::new()),
            Arc::new(InMemoryGrantStore::new()),
        )
    }

    pub fn with_stores(requests: Arc<dyn RequestStore>, grants: Arc<dyn GrantStore>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let federation = FakeFederation::new(FederationMode::Succeed);
        let lifecycle = RequestLifecycle::new(
            Arc::clone(&requests),
            Arc::clone(&grants),
            trust_roles(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            test_policy(),
        );
        let issuer = CredentialIssuer::new(
            Arc::clone(&grants),
            Arc::clone(&federation) as Arc<dyn FederationService>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            issuer_settings(),
        );
        Self {
            clock,
            requests,
            grants,
            federation,
            lifecycle,
            issuer,
        }
    }

    /// Submit a request for `resource` as the default user.
    pub async fn submit(&self, resource: &str, hours: f64) -> String {
        self.lifecycle
            .submit(&user(), resource, "quarterly audit", hours)
            .await
            .expect("submit")
    }

    pub async fn status(&self, id: &str) -> RequestStatus {
        self.requests
            .get(id)
            .await
            .expect("store read")
            .expect("request exists")
            .status
    }
}
