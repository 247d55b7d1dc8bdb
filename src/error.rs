//! Error types for the access broker

use std::io;

use thiserror::Error;

/// Result type alias for the access broker
pub type Result<T> = std::result::Result<T, Error>;

/// Access broker errors
///
/// Every variant maps to a distinct caller-visible outcome. Only the
/// configuration and unexpected-fault variants collapse into an opaque
/// internal error at the HTTP boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, malformed, expired or unverifiable bearer token
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid identity lacking the required role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No grant exists for the (subject, resource) pair
    #[error("No access grant for this resource")]
    NoGrant,

    /// The grant exists but its expiry has passed
    #[error("Access grant expired")]
    GrantExpired,

    /// Unknown request id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed resource, duration, justification or decision value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Decision attempted on a request that is no longer pending
    #[error("Request already processed: {0}")]
    AlreadyProcessed(String),

    /// The federation service could not mint a scoped session
    #[error("Credential issuance failed: {0}")]
    IssuanceFailed(String),

    /// Backing store timed out or returned an error
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for the caller-visible outcome.
    ///
    /// Configuration problems and unexpected faults share `internal_error`
    /// so no internal detail is distinguishable from the outside.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NoGrant => "no_grant",
            Self::GrantExpired => "grant_expired",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::AlreadyProcessed(_) => "already_processed",
            Self::IssuanceFailed(_) => "issuance_failed",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Whether the caller may retry the same operation.
    ///
    /// `NotFound` and `AlreadyProcessed` are terminal for a request id.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::AlreadyProcessed(_))
    }
}
