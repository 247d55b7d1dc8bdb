//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRequestParts, Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderName, header, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::audit::{self, AuditEvent};
use crate::identity::{IdentityClaim, TokenVerifier};
use crate::issuer::{CredentialIssuer, IssuedCredential};
use crate::lifecycle::{Decision, RequestLifecycle};
use crate::store::RequestStatus;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Bearer token verifier
    pub verifier: Arc<TokenVerifier>,
    /// Request lifecycle manager
    pub lifecycle: RequestLifecycle,
    /// Credential issuer
    pub issuer: Arc<CredentialIssuer>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    let request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/request-access", post(request_access_handler))
        .route("/api/admin/pending-requests", get(pending_requests_handler))
        .route("/api/admin/request/{request_id}", post(decide_handler))
        .route("/api/get-temp-credentials", get(temp_credentials_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

/// Identity of a caller whose bearer token verified.
pub struct Authenticated(pub IdentityClaim);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| Error::Unauthenticated("missing bearer token".to_string()))?;
        match state.verifier.verify(token).await {
            Ok(claim) => Ok(Self(claim)),
            Err(e) => {
                audit::emit(&AuditEvent::auth_denied(None, e.to_string()));
                Err(e)
            }
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn bad_body(rejection: &JsonRejection) -> Error {
    Error::InvalidInput(format!("invalid request body: {}", rejection.body_text()))
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestAccessBody {
    bucket: Option<String>,
    #[serde(default)]
    reason: String,
    duration_hours: Option<f64>,
}

/// `POST /api/request-access`
async fn request_access_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(claim): Authenticated,
    body: std::result::Result<Json<RequestAccessBody>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(body) = body.map_err(|e| bad_body(&e))?;
    let bucket = body
        .bucket
        .ok_or_else(|| Error::InvalidInput("bucket is required".to_string()))?;
    let hours = body
        .duration_hours
        .ok_or_else(|| Error::InvalidInput("durationHours is required".to_string()))?;

    let request_id = state
        .lifecycle
        .submit(&claim, &bucket, &body.reason, hours)
        .await?;

    Ok(Json(json!({
        "message": "Access request submitted",
        "requestId": request_id,
    })))
}

/// `GET /api/admin/pending-requests`
async fn pending_requests_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(claim): Authenticated,
) -> Result<impl IntoResponse> {
    let mut requests = state.lifecycle.list_pending(&claim).await?;
    requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(json!({ "requests": requests })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    action: Decision,
    duration_hours: Option<f64>,
}

/// `POST /api/admin/request/{request_id}`
async fn decide_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(claim): Authenticated,
    Path(request_id): Path<String>,
    body: std::result::Result<Json<DecisionBody>, JsonRejection>,
) -> Result<impl IntoResponse> {
    // Role first: a non-admin learns nothing from body validation
    state.lifecycle.require_admin(&claim)?;
    let Json(body) = body.map_err(|e| bad_body(&e))?;
    let request = state
        .lifecycle
        .decide(&claim, &request_id, body.action, body.duration_hours)
        .await?;

    let message = match request.status {
        RequestStatus::Approved => "Request approved",
        RequestStatus::Denied => "Request denied",
        RequestStatus::Pending => "Request pending",
    };
    Ok(Json(json!({
        "message": message,
        "status": request.status,
    })))
}

#[derive(Debug, Deserialize)]
struct CredentialsQuery {
    bucket: Option<String>,
}

/// `GET /api/get-temp-credentials?bucket=`
async fn temp_credentials_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(claim): Authenticated,
    query: std::result::Result<Query<CredentialsQuery>, QueryRejection>,
) -> Result<Json<IssuedCredential>> {
    let Query(query) =
        query.map_err(|e| Error::InvalidInput(format!("invalid query: {}", e.body_text())))?;
    let bucket = query
        .bucket
        .ok_or_else(|| Error::InvalidInput("bucket is required".to_string()))?;
    let credential = state.issuer.issue(&claim, &bucket).await?;
    Ok(Json(credential))
}
