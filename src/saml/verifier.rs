//! Assertion verification seam.

use std::time::Duration;
use thiserror::Error;

use super::credentials::TrustMaterial;
use crate::session::UserProfile;

/// Why a SAML response was not accepted.
///
/// Details are for server-side logs only; clients see a bare 401.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The form value is not base64 / UTF-8 / parseable XML.
    #[error("Malformed SAML response: {0}")]
    Malformed(String),

    /// Signature, audience, issuer, destination, timing or InResponseTo check failed.
    #[error("SAML response rejected: {0}")]
    Rejected(String),

    /// The assertion carries no usable subject.
    #[error("SAML assertion missing NameID")]
    MissingSubject,

    /// Verification did not finish in time.
    #[error("SAML verification timed out after {0:?}")]
    Timeout(Duration),

    /// Too many verifications are still running on the blocking pool.
    #[error("SAML verification capacity exhausted")]
    Overloaded,

    /// The verification task panicked or was cancelled.
    #[error("SAML verification aborted: {0}")]
    Aborted(String),
}

/// Validates a raw SAML response and extracts the user profile.
///
/// Implementations are synchronous and may be CPU-heavy; callers run them on
/// the blocking pool.
pub trait AssertionVerifier: Send + Sync {
    /// Verify a base64-encoded `SAMLResponse` that must answer `request_id`.
    fn verify(
        &self,
        saml_response: &str,
        request_id: &str,
        trust: &TrustMaterial,
    ) -> Result<UserProfile, VerificationError>;
}
