//! Credential issuance against stored grants.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use access_broker::Error;
use access_broker::clock::Clock;
use access_broker::issuer::CredentialIssuer;
use access_broker::lifecycle::Decision;
use access_broker::store::{InMemoryRequestStore, RequestStatus, RequestStore};
use chrono::Duration;
use common::{
    FederationMode, Harness, HangingGrantStore, REPORTS_ROLE, admin, identity, issuer_settings,
    start_time, user,
};
use pretty_assertions::assert_eq;

/// Submit and approve `resource` for the default user.
async fn approved(h: &Harness, resource: &str, hours: f64) -> String {
    let id = h.submit(resource, hours).await;
    h.lifecycle
        .decide(&admin(), &id, Decision::Approve, Some(hours))
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn no_grant_is_refused_without_federation_call() {
    // GIVEN: nothing approved
    let h = Harness::new();

    // WHEN
    let result = h.issuer.issue(&user(), "reports").await;

    // THEN
    assert!(matches!(result, Err(Error::NoGrant)));
    assert!(h.federation.calls().is_empty());
}

#[tokio::test]
async fn pending_request_is_not_a_grant() {
    let h = Harness::new();
    h.submit("reports", 2.0).await;

    let result = h.issuer.issue(&user(), "reports").await;

    assert!(matches!(result, Err(Error::NoGrant)));
}

#[tokio::test]
async fn valid_grant_issues_scoped_credentials() {
    // GIVEN: an approved grant
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;

    // WHEN
    let credential = h.issuer.issue(&user(), "reports").await.unwrap();

    // THEN: the federation service was asked for the grant's role
    assert_eq!(credential.access_key_id, "ASIATESTACCESSKEY");
    assert_eq!(credential.session_token, "test-session-token");
    assert_eq!(credential.region, "us-east-1");

    let calls = h.federation.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].role_ref, REPORTS_ROLE);
    assert_eq!(calls[0].session_name, "temp-access-user-1-reports");
    assert_eq!(calls[0].duration, StdDuration::from_secs(3600));
}

#[tokio::test]
async fn credentials_can_be_issued_repeatedly() {
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;

    for _ in 0..3 {
        h.issuer.issue(&user(), "reports").await.unwrap();
    }

    assert_eq!(h.federation.calls().len(), 3);
}

#[tokio::test]
async fn grant_expires_exactly_at_its_expiry() {
    // GIVEN: a 2 hour grant
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;
    let expiry = start_time() + Duration::hours(2);

    // WHEN: one second before expiry
    h.clock.set(expiry - Duration::seconds(1));
    // THEN: still valid
    assert!(h.issuer.issue(&user(), "reports").await.is_ok());

    // WHEN: at the expiry instant
    h.clock.set(expiry);
    // THEN: expired
    assert!(matches!(
        h.issuer.issue(&user(), "reports").await,
        Err(Error::GrantExpired)
    ));
    assert_eq!(h.federation.calls().len(), 1);
}

#[tokio::test]
async fn expired_grant_stays_in_place_until_reapproved() {
    // GIVEN: an expired grant
    let h = Harness::new();
    approved(&h, "reports", 1.0).await;
    h.clock.advance(Duration::hours(2));
    assert!(matches!(
        h.issuer.issue(&user(), "reports").await,
        Err(Error::GrantExpired)
    ));

    // WHEN: a new request is approved
    approved(&h, "reports", 1.0).await;

    // THEN: issuance works again
    assert!(h.issuer.issue(&user(), "reports").await.is_ok());
}

#[tokio::test]
async fn grants_are_per_subject_and_resource() {
    // GIVEN: user-1 holds a grant on reports
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;

    // WHEN/THEN: another subject, or another resource, has nothing
    assert!(matches!(
        h.issuer.issue(&identity("user-2", &[]), "reports").await,
        Err(Error::NoGrant)
    ));
    assert!(matches!(
        h.issuer.issue(&user(), "logs").await,
        Err(Error::NoGrant)
    ));
}

#[tokio::test]
async fn resource_is_trimmed_before_lookup() {
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;

    assert!(h.issuer.issue(&user(), "  reports ").await.is_ok());
}

#[tokio::test]
async fn empty_resource_is_invalid() {
    let h = Harness::new();

    assert!(matches!(
        h.issuer.issue(&user(), "  ").await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn federation_refusal_is_issuance_failure() {
    // GIVEN: a grant, but the role's trust policy refuses the broker
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;
    h.federation.set_mode(FederationMode::Refuse);

    // WHEN
    let result = h.issuer.issue(&user(), "reports").await;

    // THEN
    assert!(matches!(result, Err(Error::IssuanceFailed(_))));
}

#[tokio::test]
async fn slow_federation_times_out() {
    // GIVEN: a federation service that never answers
    let h = Harness::new();
    approved(&h, "reports", 2.0).await;
    h.federation.set_mode(FederationMode::Hang);

    // WHEN
    let result = h.issuer.issue(&user(), "reports").await;

    // THEN: bounded by the federation timeout
    match result {
        Err(Error::IssuanceFailed(message)) => assert!(message.contains("timed out")),
        other => panic!("expected IssuanceFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unreadable_grant_store_is_unavailable() {
    // GIVEN: a grant store that never answers
    let h = Harness::new();
    let issuer = CredentialIssuer::new(
        Arc::new(HangingGrantStore),
        h.federation.clone(),
        h.clock.clone() as Arc<dyn Clock>,
        issuer_settings(),
    );

    // WHEN
    let result = issuer.issue(&user(), "reports").await;

    // THEN
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    assert!(h.federation.calls().is_empty());
}

#[tokio::test]
async fn denied_request_grants_nothing() {
    let h = Harness::with_stores(
        Arc::new(InMemoryRequestStore::new()),
        Arc::new(access_broker::store::InMemoryGrantStore::new()),
    );
    let id = h.submit("reports", 2.0).await;
    h.lifecycle
        .decide(&admin(), &id, Decision::Deny, None)
        .await
        .unwrap();

    assert_eq!(
        h.requests.get(&id).await.unwrap().unwrap().status,
        RequestStatus::Denied
    );
    assert!(matches!(
        h.issuer.issue(&user(), "reports").await,
        Err(Error::NoGrant)
    ));
}
