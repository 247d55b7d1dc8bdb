//! Federation service: exchanges a trust role for a scoped session.
//!
//! [`StsFederation`] is the production implementation, calling
//! `AssumeRole` on AWS STS through the Query API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::Result;
use crate::aws::{AwsClient, AwsCredentials};
use crate::config::{FederationConfig, MAX_SESSION_DURATION, MIN_SESSION_DURATION};

const STS_VERSION: &str = "2011-06-15";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Federation failures.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// The call did not complete in time.
    #[error("federation call timed out")]
    Timeout,

    /// Transport failure.
    #[error("federation transport error: {0}")]
    Transport(String),

    /// The service refused the request (bad trust relationship, throttling...).
    #[error("federation refused ({status}): {code}: {message}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Service error code
        code: String,
        /// Service error message
        message: String,
    },

    /// The response could not be understood.
    #[error("malformed federation response: {0}")]
    Malformed(String),
}

/// What to ask the federation service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Trust role to assume
    pub role_ref: String,
    /// Session name recorded by the service
    pub session_name: String,
    /// Requested session lifetime
    pub duration: Duration,
}

/// Temporary credentials minted by the federation service.
#[derive(Clone)]
pub struct ScopedSession {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// When the credentials stop working
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSession")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Mints scoped sessions for a trust role.
#[async_trait]
pub trait FederationService: Send + Sync + 'static {
    /// Assume `request.role_ref` and return the resulting session.
    async fn assume_role(
        &self,
        request: &SessionRequest,
    ) -> std::result::Result<ScopedSession, FederationError>;
}

/// AWS STS `AssumeRole` client.
pub struct StsFederation {
    client: AwsClient,
}

impl StsFederation {
    /// Build a client using base credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if credentials are missing or the
    /// endpoint is invalid.
    pub fn from_config(config: &FederationConfig) -> Result<Self> {
        Self::with_credentials(config, AwsCredentials::from_env()?)
    }

    /// Build a client with explicit base credentials.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the endpoint is invalid.
    pub fn with_credentials(config: &FederationConfig, credentials: AwsCredentials) -> Result<Self> {
        let client = AwsClient::new(
            "sts",
            config.region.clone(),
            &config.resolved_endpoint(),
            credentials,
            config.timeout,
        )?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FederationService for StsFederation {
    async fn assume_role(
        &self,
        request: &SessionRequest,
    ) -> std::result::Result<ScopedSession, FederationError> {
        let duration = request
            .duration
            .clamp(MIN_SESSION_DURATION, MAX_SESSION_DURATION)
            .as_secs()
            .to_string();
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", "AssumeRole")
            .append_pair("Version", STS_VERSION)
            .append_pair("RoleArn", &request.role_ref)
            .append_pair("RoleSessionName", &request.session_name)
            .append_pair("DurationSeconds", &duration)
            .finish();

        debug!(
            endpoint = %self.client.endpoint(),
            role = %request.role_ref,
            session = %request.session_name,
            "Calling AssumeRole"
        );
        let response = self
            .client
            .post(&[("content-type", FORM_CONTENT_TYPE)], body.into_bytes())
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FederationError::Timeout
                } else {
                    FederationError::Transport(e.to_string())
                }
            })?;

        if !response.status.is_success() {
            return Err(parse_error(response.status.as_u16(), &response.body));
        }
        parse_assume_role(&response.body)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    error: StsError,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn parse_assume_role(body: &str) -> std::result::Result<ScopedSession, FederationError> {
    let parsed: AssumeRoleResponse =
        quick_xml::de::from_str(body).map_err(|e| FederationError::Malformed(e.to_string()))?;
    let creds = parsed.assume_role_result.credentials;
    if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() {
        return Err(FederationError::Malformed("empty credentials".to_string()));
    }
    let expiration = DateTime::parse_from_rfc3339(creds.expiration.trim())
        .map_err(|e| FederationError::Malformed(format!("bad expiration: {e}")))?
        .with_timezone(&Utc);
    Ok(ScopedSession {
        access_key_id: creds.access_key_id,
        secret_access_key: creds.secret_access_key,
        session_token: creds.session_token,
        expiration,
    })
}

fn parse_error(status: u16, body: &str) -> FederationError {
    match quick_xml::de::from_str::<ErrorResponse>(body) {
        Ok(parsed) => FederationError::Rejected {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => FederationError::Rejected {
            status,
            code: "Unknown".to_string(),
            message: body.chars().take(200).collect(),
        },
    }
}
