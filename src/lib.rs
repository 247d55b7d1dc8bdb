//! Access Broker Library
//!
//! Brokers temporary, time-limited access to storage resources: a user
//! requests access, an administrator approves or denies it, and the
//! requester then redeems short-lived scoped credentials until the grant
//! expires.
//!
//! # Components
//!
//! - **Identity**: bearer token verification against a rotating key set
//! - **Lifecycle**: pending → approved/denied with a guarded grant write
//! - **Issuer**: grant check and scoped session minting via STS
//! - **Stores**: in-memory or DynamoDB request and grant tables

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod aws;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod federation;
pub mod identity;
pub mod issuer;
pub mod lifecycle;
pub mod server;
pub mod store;
pub mod trust_roles;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
