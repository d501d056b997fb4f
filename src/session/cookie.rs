//! Signed session cookie values.
//!
//! Cookie value format: `{session_id_hex}.{hmac_sha256_hex}`.
//! The signature binds the ID to the server-side session secret so that
//! forged or truncated values are rejected before any store lookup.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::types::SessionId;

type HmacSha256 = Hmac<Sha256>;

/// Sign a session ID for use as a cookie value.
pub fn sign(secret: &[u8], id: SessionId) -> String {
    let hex_id = id.to_hex();
    let signature = compute_hmac(secret, &hex_id);
    format!("{}.{}", hex_id, signature)
}

/// Verify a signed cookie value and return the session ID.
pub fn verify(secret: &[u8], value: &str) -> Option<SessionId> {
    let (hex_id, signature) = value.split_once('.')?;
    let expected = compute_hmac(secret, hex_id);
    if !bool::from(signature.as_bytes().ct_eq(expected.as_bytes())) {
        return None;
    }
    SessionId::from_hex(hex_id)
}

fn compute_hmac(secret: &[u8], data: &str) -> String {
    // HMAC accepts keys of any length; the error branch is unreachable.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-session-secret-32-bytes!!!!";

    #[test]
    fn test_sign_and_verify() {
        let id = SessionId::new();
        let value = sign(SECRET, id);
        assert_eq!(verify(SECRET, &value), Some(id));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let value = sign(SECRET, SessionId::new());
        assert_eq!(verify(b"another-secret-entirely-different", &value), None);
    }

    #[test]
    fn test_tampered_value_rejected() {
        let value = sign(SECRET, SessionId::new());
        let other = SessionId::new().to_hex();
        let (_, signature) = value.split_once('.').unwrap();
        assert_eq!(verify(SECRET, &format!("{}.{}", other, signature)), None);
    }

    #[test]
    fn test_unsigned_value_rejected() {
        let id = SessionId::new();
        assert_eq!(verify(SECRET, &id.to_hex()), None);
        assert_eq!(verify(SECRET, ""), None);
    }
}
