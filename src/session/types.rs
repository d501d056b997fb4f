//! Session and user profile types for SAML authentication.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Unique session identifier (16-byte random value, hex-encoded in cookies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for cookies and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity asserted by the IdP for one successful login.
///
/// Only produced by an [`AssertionVerifier`](crate::saml::AssertionVerifier)
/// and never modified after it is attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// Subject NameID value.
    pub name_id: String,

    /// NameID format (e.g., transient, persistent, emailAddress).
    pub name_id_format: Option<String>,

    /// Entity ID of the IdP that issued the assertion.
    pub issuer: String,

    /// Assertion ID.
    pub assertion_id: String,

    /// Session index from the AuthnStatement.
    pub session_index: Option<String>,

    /// Attribute assertions as name -> values.
    pub attributes: HashMap<String, Vec<String>>,
}

/// `start + ttl_secs`, saturating at the latest representable instant.
pub fn expiry_after(start: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| start.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A browser session, authenticated or not.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID.
    pub id: SessionId,

    /// Profile attached after a successful login.
    pub profile: Option<Arc<UserProfile>>,

    /// Session creation time.
    pub created_at: DateTime<Utc>,

    /// Last access time (updated on each lookup).
    pub last_accessed: DateTime<Utc>,

    /// Session expiry time.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a new unauthenticated session.
    pub fn new(ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            profile: None,
            created_at: now,
            last_accessed: now,
            expires_at: expiry_after(now, ttl_secs),
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Whether a profile is attached.
    pub fn is_authenticated(&self) -> bool {
        self.profile.is_some()
    }

    /// Update last accessed time.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}
