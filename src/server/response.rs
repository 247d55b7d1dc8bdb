//! Error → HTTP response mapping.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::Error;

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::NoGrant | Error::GrantExpired => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::AlreadyProcessed(_) => StatusCode::CONFLICT,
        Error::IssuanceFailed(_) => StatusCode::BAD_GATEWAY,
        Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_)
        | Error::Io(_)
        | Error::Json(_)
        | Error::Http(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Message returned to the caller. Details of authentication failures and
/// backend faults stay in the logs.
fn public_message(error: &Error) -> String {
    match error {
        Error::Unauthenticated(_) => "Authentication required".to_string(),
        Error::IssuanceFailed(_) => "Failed to obtain temporary credentials".to_string(),
        Error::StoreUnavailable(_) => "Service temporarily unavailable".to_string(),
        Error::Config(_)
        | Error::Io(_)
        | Error::Json(_)
        | Error::Http(_)
        | Error::Internal(_) => "Internal server error".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        } else if status == StatusCode::UNAUTHORIZED {
            warn!(error = %self, "Authentication failed");
        } else {
            debug!(error = %self, code = self.code(), "Request refused");
        }

        let mut response = error_response(status, self.code(), &public_message(&self));
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_distinct_per_kind() {
        assert_eq!(status_for(&Error::Unauthenticated("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&Error::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::NoGrant), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::GrantExpired), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::AlreadyProcessed("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&Error::IssuanceFailed("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&Error::StoreUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::Config("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn opaque_errors_hide_details() {
        // GIVEN: a configuration error naming an internal resource
        let error = Error::Config("no trust role configured for resource 'secret-bucket'".into());

        // WHEN/THEN: the caller sees a generic message
        assert_eq!(public_message(&error), "Internal server error");
    }

    #[test]
    fn unauthenticated_sets_challenge_header() {
        let response = Error::Unauthenticated("bad signature".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[test]
    fn client_errors_keep_their_message() {
        let message = public_message(&Error::InvalidInput("bucket must not be empty".into()));
        assert!(message.contains("bucket must not be empty"));
    }
}
