//! Verified identity claims and role checks.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity extracted from a bearer token whose signature, issuer,
/// audience and expiry have all been verified.
///
/// Only [`TokenVerifier`](super::TokenVerifier) constructs these from
/// untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    /// Stable subject identifier (`sub`).
    pub subject: String,
    /// Email address, when the provider includes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Group memberships.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Token expiry (`exp`).
    pub expires_at: DateTime<Utc>,
}

impl IdentityClaim {
    /// Whether the identity is a member of `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.groups.contains(role)
    }
}

/// Fail with [`Error::Forbidden`] unless `claim` carries `role`.
pub fn require_role(claim: &IdentityClaim, role: &str) -> Result<()> {
    if claim.has_role(role) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("role '{role}' required")))
    }
}
