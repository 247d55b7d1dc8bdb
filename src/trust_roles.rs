//! Resource → trust-role mapping.

use std::collections::HashMap;
use std::env;

use crate::config::AccessConfig;
use crate::{Error, Result};

/// Resolves the trust role assumed when issuing credentials for a resource.
///
/// Lookups are by normalized resource id (trimmed, lowercased). When the
/// configured map has no entry, `<env_prefix><RESOURCE>` is consulted, with
/// the resource upper-cased and anything outside `[A-Z0-9_]` replaced by `_`.
#[derive(Debug, Clone)]
pub struct TrustRoleResolver {
    roles: HashMap<String, String>,
    env_prefix: String,
}

impl TrustRoleResolver {
    /// Build a resolver from a resource → role map.
    #[must_use]
    pub fn new(roles: HashMap<String, String>, env_prefix: impl Into<String>) -> Self {
        Self {
            roles: roles
                .into_iter()
                .map(|(resource, role)| (normalize(&resource), role.trim().to_string()))
                .filter(|(_, role)| !role.is_empty())
                .collect(),
            env_prefix: env_prefix.into(),
        }
    }

    /// Build a resolver from the access configuration.
    #[must_use]
    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(config.trust_roles.clone(), config.trust_role_env_prefix.clone())
    }

    /// Trust role for `resource`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no mapping exists.
    pub fn resolve(&self, resource: &str) -> Result<String> {
        self.resolve_with(resource, |name| env::var(name).ok())
    }

    fn resolve_with(
        &self,
        resource: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String> {
        if let Some(role) = self.roles.get(&normalize(resource)) {
            return Ok(role.clone());
        }
        if !self.env_prefix.is_empty() {
            let var = self.env_var_name(resource);
            if let Some(role) = lookup(&var) {
                let role = role.trim();
                if !role.is_empty() {
                    return Ok(role.to_string());
                }
            }
        }
        Err(Error::Config(format!(
            "no trust role configured for resource '{}'",
            resource.trim()
        )))
    }

    /// Number of explicitly configured mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// Whether no explicit mappings are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn env_var_name(&self, resource: &str) -> String {
        let suffix: String = resource
            .trim()
            .chars()
            .map(|c| {
                let c = c.to_ascii_uppercase();
                if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }
            })
            .collect();
        format!("{}{suffix}", self.env_prefix)
    }
}

fn normalize(resource: &str) -> String {
    resource.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &[(&str, &str)]) -> TrustRoleResolver {
        TrustRoleResolver::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            "ACCESS_BROKER_TEST_ROLE_",
        )
    }

    #[test]
    fn lookup_is_normalized() {
        let roles = resolver(&[("Reports", "arn:aws:iam::1:role/reports")]);
        assert_eq!(roles.resolve("reports").unwrap(), "arn:aws:iam::1:role/reports");
        assert_eq!(roles.resolve("  REPORTS ").unwrap(), "arn:aws:iam::1:role/reports");
    }

    #[test]
    fn unmapped_resource_is_config_error() {
        let roles = resolver(&[("reports", "arn:aws:iam::1:role/reports")]);
        assert!(matches!(roles.resolve("finance"), Err(Error::Config(_))));
    }

    #[test]
    fn blank_role_entries_are_dropped() {
        let roles = resolver(&[("reports", "  ")]);
        assert!(roles.is_empty());
        assert!(roles.resolve("reports").is_err());
    }

    #[test]
    fn env_var_name_sanitizes_resource() {
        let roles = resolver(&[]);
        assert_eq!(
            roles.env_var_name("my-data.bucket"),
            "ACCESS_BROKER_TEST_ROLE_MY_DATA_BUCKET"
        );
    }

    #[test]
    fn env_fallback_resolves() {
        // GIVEN: no explicit mapping but an environment entry
        let roles = resolver(&[]);
        let lookup = |name: &str| {
            (name == "ACCESS_BROKER_TEST_ROLE_ENV_ONLY").then(|| "arn:aws:iam::1:role/env".to_string())
        };

        // WHEN/THEN: the environment entry is used
        assert_eq!(
            roles.resolve_with("env-only", lookup).unwrap(),
            "arn:aws:iam::1:role/env"
        );
        assert!(roles.resolve_with("other", lookup).is_err());
    }

    #[test]
    fn explicit_mapping_wins_over_environment() {
        let roles = resolver(&[("reports", "arn:aws:iam::1:role/map")]);
        let lookup = |_: &str| Some("arn:aws:iam::1:role/env".to_string());
        assert_eq!(
            roles.resolve_with("reports", lookup).unwrap(),
            "arn:aws:iam::1:role/map"
        );
    }
}
