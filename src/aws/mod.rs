//! Minimal AWS wire client: base credentials, SigV4 signing and a signed
//! POST helper shared by the STS and DynamoDB clients.

pub mod sigv4;

use std::{env, fmt, time::Duration};

use chrono::Utc;
use reqwest::StatusCode;
use url::Url;

use crate::{Error, Result};

/// Long-lived (or instance-provided temporary) base credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token, when the base credentials are themselves temporary
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Read base credentials from the standard environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key id or secret is missing.
    pub fn from_env() -> Result<Self> {
        let access_key_id = non_empty_var("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| Error::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = non_empty_var("AWS_SECRET_ACCESS_KEY")
            .ok_or_else(|| Error::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty_var("AWS_SESSION_TOKEN"),
        })
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Raw response of a signed call.
#[derive(Debug)]
pub struct AwsResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response body
    pub body: String,
}

/// Signs and sends POST requests to one AWS service endpoint.
pub struct AwsClient {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    service: &'static str,
    credentials: AwsCredentials,
}

impl AwsClient {
    /// Build a client for `service` at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint is not a valid URL or the
    /// HTTP client cannot be built.
    pub fn new(
        service: &'static str,
        region: impl Into<String>,
        endpoint: &str,
        credentials: AwsCredentials,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid {service} endpoint '{endpoint}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build {service} client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            region: region.into(),
            service,
            credentials,
        })
    }

    /// The endpoint requests are sent to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sign and send a POST with `body`.
    ///
    /// `headers` (lowercase names) are sent and covered by the signature.
    pub async fn post(
        &self,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> std::result::Result<AwsResponse, reqwest::Error> {
        let params = sigv4::SigningParams {
            credentials: &self.credentials,
            region: &self.region,
            service: self.service,
            time: Utc::now(),
        };
        let auth_headers = sigv4::sign("POST", &self.endpoint, headers, &body, &params);

        let mut request = self.http.post(self.endpoint.clone());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        for (name, value) in auth_headers {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(AwsResponse { status, body })
    }
}
