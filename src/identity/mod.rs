//! Bearer identity: signing-key cache, token verification and role checks.

pub mod claims;
pub mod keys;
pub mod verifier;

pub use claims::{IdentityClaim, require_role};
pub use keys::{HttpKeySetSource, KeyCache, KeyFetchError, KeySetSource};
pub use verifier::{TokenVerifier, VerifierSettings};
