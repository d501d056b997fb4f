//! SAML Service Provider configuration.

use std::fmt;

use super::requests::DEFAULT_REQUEST_TTL_SECS;
use crate::session::{cookie, SessionId, DEFAULT_CLEANUP_INTERVAL_SECS};

/// NameID format requested from the IdP by default.
pub const TRANSIENT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

/// Upper bound on `session_ttl_secs` (30 days).
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
/// Upper bound on `request_ttl_secs` and `max_issue_delay_secs` (1 hour).
pub const MAX_REQUEST_TTL_SECS: u64 = 60 * 60;
/// Upper bound on `verify_timeout_secs`.
pub const MAX_VERIFY_TIMEOUT_SECS: u64 = 120;

/// Secret used to sign session cookies. Redacted in `Debug` output.
#[derive(Clone, Default)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(<redacted>)")
    }
}

/// SAML Service Provider configuration.
#[derive(Debug, Clone)]
pub struct SamlConfig {
    /// SP Entity ID (issuer of our AuthnRequests, audience of assertions).
    pub entity_id: String,

    /// Assertion Consumer Service URL (where the IdP posts the SAML response).
    pub callback_url: String,

    /// IdP Single Sign-On URL (HTTP-Redirect binding).
    pub idp_sso_url: String,

    /// IdP Entity ID (expected issuer of assertions).
    pub idp_entity_id: String,

    /// NameID format to request.
    pub name_id_format: String,

    /// Secret used to sign session cookies.
    pub session_secret: SessionSecret,

    /// Session TTL in seconds (default: 8 hours).
    pub session_ttl_secs: u64,

    /// Lifetime of an outstanding AuthnRequest in seconds.
    pub request_ttl_secs: u64,

    /// Maximum accepted age of a response's IssueInstant in seconds.
    pub max_issue_delay_secs: i64,

    /// Upper bound on assertion verification time in seconds.
    pub verify_timeout_secs: u64,

    /// Cleanup interval in seconds.
    pub cleanup_interval_secs: u64,

    /// Cookie name for session ID.
    pub session_cookie_name: String,

    /// Cookie domain (optional, defaults to request host).
    pub cookie_domain: Option<String>,

    /// Cookie path.
    pub cookie_path: String,

    /// Require HTTPS for cookies (Secure flag).
    pub cookie_secure: bool,

    /// Set HttpOnly flag on cookies.
    pub cookie_http_only: bool,

    /// SameSite attribute.
    pub cookie_same_site: String,
}

fn default_name_id_format() -> String {
    TRANSIENT_NAME_ID_FORMAT.to_string()
}

fn default_session_ttl() -> u64 {
    8 * 60 * 60 // 8 hours
}

fn default_request_ttl() -> u64 {
    DEFAULT_REQUEST_TTL_SECS
}

fn default_max_issue_delay() -> i64 {
    90
}

fn default_verify_timeout() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_cookie_name() -> String {
    "saml_sso_session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> String {
    "Lax".to_string()
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            callback_url: String::new(),
            idp_sso_url: String::new(),
            idp_entity_id: String::new(),
            name_id_format: default_name_id_format(),
            session_secret: SessionSecret::default(),
            session_ttl_secs: default_session_ttl(),
            request_ttl_secs: default_request_ttl(),
            max_issue_delay_secs: default_max_issue_delay(),
            verify_timeout_secs: default_verify_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            session_cookie_name: default_cookie_name(),
            cookie_domain: None,
            cookie_path: default_cookie_path(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: default_same_site(),
        }
    }
}

impl SamlConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.entity_id.is_empty() {
            return Err("SAML entity_id (ISSUER) is required".to_string());
        }

        if self.callback_url.is_empty() {
            return Err("SAML callback_url (CALLBACK_URL) is required".to_string());
        }

        if !self.callback_path().starts_with('/') {
            return Err(format!(
                "SAML callback_url must be an absolute URL: {}",
                self.callback_url
            ));
        }

        if self.idp_sso_url.is_empty() {
            return Err("SAML idp_sso_url (ENTRYPOINT) is required".to_string());
        }

        if self.idp_entity_id.is_empty() {
            return Err("SAML idp_entity_id (IDP_ENTITY_ID) is required".to_string());
        }

        if self.session_secret.is_empty() {
            return Err("Session secret (SESSION_SECRET) is required".to_string());
        }

        for (name, value, max) in [
            ("session_ttl_secs", self.session_ttl_secs, MAX_SESSION_TTL_SECS),
            ("request_ttl_secs", self.request_ttl_secs, MAX_REQUEST_TTL_SECS),
            ("verify_timeout_secs", self.verify_timeout_secs, MAX_VERIFY_TIMEOUT_SECS),
        ] {
            if value == 0 || value > max {
                return Err(format!("{} must be between 1 and {}, got {}", name, max, value));
            }
        }

        if !(1..=MAX_REQUEST_TTL_SECS as i64).contains(&self.max_issue_delay_secs) {
            return Err(format!(
                "max_issue_delay_secs must be between 1 and {}, got {}",
                MAX_REQUEST_TTL_SECS, self.max_issue_delay_secs
            ));
        }

        Ok(())
    }

    /// Path component of the callback URL, used to mount the ACS route.
    pub fn callback_path(&self) -> &str {
        let after_scheme = match self.callback_url.split_once("://") {
            Some((_, rest)) => rest,
            None => return "",
        };
        let path = match after_scheme.find('/') {
            Some(idx) => &after_scheme[idx..],
            None => "/",
        };
        path.split(['?', '#']).next().unwrap_or("/")
    }

    /// Build the session cookie for `id`.
    pub fn build_cookie(&self, id: SessionId) -> String {
        let value = cookie::sign(self.session_secret.as_bytes(), id);
        self.format_cookie(&value, self.session_ttl_secs)
    }

    /// Build a cookie that clears the session cookie on the client.
    pub fn build_expired_cookie(&self) -> String {
        self.format_cookie("", 0)
    }

    /// Parse and verify the session ID from a cookie header.
    pub fn parse_session_cookie(&self, cookie_header: &str) -> Option<SessionId> {
        let prefix = format!("{}=", self.session_cookie_name);
        for part in cookie_header.split(';') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix(&prefix) {
                return cookie::verify(self.session_secret.as_bytes(), value);
            }
        }
        None
    }

    fn format_cookie(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.session_cookie_name, value);

        if let Some(ref domain) = self.cookie_domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.cookie_path));

        if self.cookie_secure {
            cookie.push_str("; Secure");
        }

        if self.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie.push_str(&format!("; SameSite={}", self.cookie_same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }
}
