//! SAML authentication module.
//!
//! Provides SP-initiated SSO: credential loading, AuthnRequest correlation,
//! assertion verification and SP metadata.

pub mod config;
pub mod credentials;
pub mod metadata;
pub mod provider;
pub mod requests;
pub mod verifier;

pub use config::{SamlConfig, SessionSecret};
pub use credentials::{CredentialPaths, TrustMaterial};
pub use provider::{AuthnRedirect, SamlProvider};
pub use requests::{CorrelationError, RequestTracker, DEFAULT_REQUEST_TTL_SECS};
pub use verifier::{AssertionVerifier, VerificationError};
