//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// STS rejects sessions shorter than 15 minutes.
pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(15 * 60);
/// STS rejects sessions longer than 12 hours.
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Identity provider (token verification)
    pub identity: IdentityConfig,
    /// Request lifecycle and trust-role mapping
    pub access: AccessConfig,
    /// Federation service (scoped credential minting)
    pub federation: FederationConfig,
    /// Durable store backend
    pub store: StoreConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Provider region (used to derive the default issuer)
    pub region: String,
    /// User pool identifier (used to derive the default issuer)
    pub user_pool_id: String,
    /// Expected `aud` claim (the app client id)
    pub client_id: String,
    /// Explicit issuer URL; overrides the region/pool derivation
    pub issuer: Option<String>,
    /// Explicit JWKS URI; defaults to `<issuer>/.well-known/jwks.json`
    pub jwks_uri: Option<String>,
    /// Claim carrying group memberships
    pub groups_claim: String,
    /// Group that grants the administrative role
    pub admin_group: String,
    /// Required `token_use` claim value, if any (`id` for ID tokens)
    pub token_use: Option<String>,
    /// Clock skew tolerance for `exp`
    pub leeway_secs: u64,
    /// Key-set fetch timeout
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            user_pool_id: String::new(),
            client_id: String::new(),
            issuer: None,
            jwks_uri: None,
            groups_claim: "cognito:groups".to_string(),
            admin_group: "admin".to_string(),
            token_use: None,
            leeway_secs: 60,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl IdentityConfig {
    /// The issuer every token must carry.
    #[must_use]
    pub fn resolved_issuer(&self) -> String {
        match self.issuer {
            Some(ref issuer) => issuer.trim_end_matches('/').to_string(),
            None => format!(
                "https://cognito-idp.{}.amazonaws.com/{}",
                self.region, self.user_pool_id
            ),
        }
    }

    /// Where the provider publishes its signing keys.
    #[must_use]
    pub fn resolved_jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| format!("{}/.well-known/jwks.json", self.resolved_issuer()))
    }
}

/// Request lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Resource identifier -> trust-role reference
    pub trust_roles: HashMap<String, String>,
    /// Environment fallback prefix (`<prefix><RESOURCE>`); empty disables it
    pub trust_role_env_prefix: String,
    /// Upper bound for requested and approved durations
    pub max_duration_hours: f64,
    /// Upper bound for the justification text (characters)
    pub max_justification_len: usize,
    /// Attempts for the grant upsert (and the compensating rollback)
    pub grant_write_attempts: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            trust_roles: HashMap::new(),
            trust_role_env_prefix: "TEMP_ROLE_ARN_".to_string(),
            max_duration_hours: 24.0 * 365.0,
            max_justification_len: 2000,
            grant_write_attempts: 3,
        }
    }
}

/// Federation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Operating region, returned with every issued credential
    pub region: String,
    /// Explicit STS endpoint; defaults to `https://sts.<region>.amazonaws.com`
    pub endpoint: Option<String>,
    /// Ceiling on the issued session lifetime
    #[serde(with = "humantime_serde")]
    pub session_duration: Duration,
    /// Session name prefix (`<prefix>-<subject>-<resource>`)
    pub session_name_prefix: String,
    /// Federation call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            session_duration: Duration::from_secs(3600),
            session_name_prefix: "temp-access".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl FederationConfig {
    /// The STS endpoint to call.
    #[must_use]
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com", self.region))
    }
}

/// Store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps (development and tests)
    #[default]
    Memory,
    /// DynamoDB tables
    Dynamodb,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to use
    pub backend: StoreBackend,
    /// Store region; defaults to the federation region
    pub region: Option<String>,
    /// Explicit endpoint (e.g. a local DynamoDB)
    pub endpoint: Option<String>,
    /// Access request table
    pub requests_table: String,
    /// Access grant table
    pub grants_table: String,
    /// Per-operation timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            region: None,
            endpoint: None,
            requests_table: "access_requests".to_string(),
            grants_table: "temp_access".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (ACCESS_BROKER_ prefix)
        figment = figment.merge(Env::prefixed("ACCESS_BROKER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars();

        Ok(config)
    }

    /// Check that the configuration can actually serve requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.identity.issuer.is_none() && self.identity.user_pool_id.is_empty() {
            return Err(Error::Config(
                "identity.user_pool_id or identity.issuer must be set".to_string(),
            ));
        }
        if self.identity.client_id.is_empty() {
            return Err(Error::Config("identity.client_id must be set".to_string()));
        }
        if self.identity.admin_group.is_empty() {
            return Err(Error::Config("identity.admin_group must not be empty".to_string()));
        }
        let session = self.federation.session_duration;
        if !(MIN_SESSION_DURATION..=MAX_SESSION_DURATION).contains(&session) {
            return Err(Error::Config(format!(
                "federation.session_duration must be between {}s and {}s (got {}s)",
                MIN_SESSION_DURATION.as_secs(),
                MAX_SESSION_DURATION.as_secs(),
                session.as_secs()
            )));
        }
        if !(self.access.max_duration_hours.is_finite() && self.access.max_duration_hours > 0.0) {
            return Err(Error::Config(
                "access.max_duration_hours must be a positive number".to_string(),
            ));
        }
        if self.access.grant_write_attempts == 0 {
            return Err(Error::Config(
                "access.grant_write_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in role references and endpoints
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for role in self.access.trust_roles.values_mut() {
            *role = Self::expand_string(&re, role);
        }
        for endpoint in [
            &mut self.identity.issuer,
            &mut self.identity.jwks_uri,
            &mut self.federation.endpoint,
            &mut self.store.endpoint,
        ]
        .into_iter()
        .flatten()
        {
            *endpoint = Self::expand_string(&re, endpoint);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
