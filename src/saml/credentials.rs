//! Service Provider and IdP trust material.
//!
//! Loaded once at startup. Any missing or malformed file is fatal.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use openssl::pkey::{PKey, Private};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

/// File locations of the PEM-encoded keys and certificates.
#[derive(Debug, Clone)]
pub struct CredentialPaths {
    /// SP private key for decrypting assertions.
    pub decryption_key: PathBuf,
    /// SP private key for signing AuthnRequests.
    pub signing_key: PathBuf,
    /// SP certificate matching `decryption_key`.
    pub decryption_cert: PathBuf,
    /// SP certificate matching `signing_key`.
    pub signing_cert: PathBuf,
    /// IdP signing certificate (PEM, or a bare base64 DER line).
    pub idp_cert: PathBuf,
}

/// A parsed X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    not_after: i64,
}

impl Certificate {
    /// Parse a certificate from PEM text or bare base64-encoded DER.
    pub fn parse(data: &str) -> Result<Self> {
        let der = decode_cert_data(data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

        let subject = cert.subject().to_string();
        let not_after = cert.validity().not_after.timestamp();

        Ok(Self {
            der,
            subject,
            not_after,
        })
    }

    /// Raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER bytes, base64-encoded on a single line (for metadata documents).
    pub fn base64_der(&self) -> String {
        BASE64.encode(&self.der)
    }

    /// Subject Distinguished Name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the certificate's notAfter is in the past.
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() > self.not_after
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Keys and certificates shared read-only by all requests.
pub struct TrustMaterial {
    pub decryption_key: PKey<Private>,
    pub signing_key: PKey<Private>,
    pub decryption_cert: Certificate,
    pub signing_cert: Certificate,
    pub idp_cert: Certificate,
}

impl fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrustMaterial(<redacted>)")
    }
}

impl TrustMaterial {
    /// Load and parse every key and certificate.
    pub fn load(paths: &CredentialPaths) -> Result<Self> {
        let decryption_key = load_private_key(&paths.decryption_key, "SP decryption key")?;
        let signing_key = load_private_key(&paths.signing_key, "SP signing key")?;
        let decryption_cert =
            load_certificate(&paths.decryption_cert, "SP decryption certificate")?;
        let signing_cert = load_certificate(&paths.signing_cert, "SP signing certificate")?;
        let idp_cert = load_certificate(&paths.idp_cert, "IdP signing certificate")?;

        for (name, cert) in [
            ("SP decryption certificate", &decryption_cert),
            ("SP signing certificate", &signing_cert),
            ("IdP signing certificate", &idp_cert),
        ] {
            if cert.is_expired() {
                warn!(certificate = name, subject = %cert.subject(), "Certificate has expired");
            }
        }

        info!(
            idp_subject = %idp_cert.subject(),
            sp_signing_subject = %signing_cert.subject(),
            "Trust material loaded"
        );

        Ok(Self {
            decryption_key,
            signing_key,
            decryption_cert,
            signing_cert,
            idp_cert,
        })
    }
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}: {:?}", what, path))
}

fn load_private_key(path: &Path, what: &str) -> Result<PKey<Private>> {
    let pem = read_file(path, what)?;
    PKey::private_key_from_pem(pem.as_bytes())
        .with_context(|| format!("Failed to parse {} (expected PEM): {:?}", what, path))
}

fn load_certificate(path: &Path, what: &str) -> Result<Certificate> {
    let data = read_file(path, what)?;
    Certificate::parse(&data).with_context(|| format!("Failed to parse {}: {:?}", what, path))
}

/// Decode certificate text: PEM, or base64 DER possibly split by whitespace.
fn decode_cert_data(data: &str) -> Result<Vec<u8>> {
    let data = data.trim();
    if data.is_empty() {
        bail!("Certificate data is empty");
    }

    if data.contains("-----BEGIN") {
        let (_, pem) = parse_x509_pem(data.as_bytes())
            .map_err(|e| anyhow!("Invalid PEM certificate: {:?}", e))?;
        if pem.label != "CERTIFICATE" {
            bail!("Expected a CERTIFICATE PEM block, found {}", pem.label);
        }
        return Ok(pem.contents);
    }

    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .context("Failed to base64 decode certificate")
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_trust_material() {
        let dir = tempdir().unwrap();
        let paths = write_credentials(dir.path());

        let trust = TrustMaterial::load(&paths).unwrap();
        assert!(trust.idp_cert.subject().contains("sp.example.com"));
        assert!(!trust.idp_cert.is_expired());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempdir().unwrap();
        let paths = write_credentials(dir.path());
        std::fs::remove_file(&paths.idp_cert).unwrap();

        let err = TrustMaterial::load(&paths).unwrap_err();
        assert!(format!("{:#}", err).contains("IdP signing certificate"));
    }

    #[test]
    fn test_malformed_key_is_fatal() {
        let dir = tempdir().unwrap();
        let paths = write_credentials(dir.path());
        std::fs::write(&paths.signing_key, "not a key").unwrap();

        let err = TrustMaterial::load(&paths).unwrap_err();
        assert!(format!("{:#}", err).contains("SP signing key"));
    }

    #[test]
    fn test_key_in_certificate_slot_is_fatal() {
        let dir = tempdir().unwrap();
        let paths = write_credentials(dir.path());
        std::fs::write(&paths.signing_cert, &key_pair().key_pem).unwrap();

        assert!(TrustMaterial::load(&paths).is_err());
    }

    #[test]
    fn test_single_line_base64_certificate() {
        let pem = &key_pair().cert_pem;
        let body: String = pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect::<Vec<_>>()
            .join(" ");

        let from_pem = Certificate::parse(pem).unwrap();
        let from_line = Certificate::parse(&body).unwrap();
        assert_eq!(from_pem.base64_der(), from_line.base64_der());
    }

    #[test]
    fn test_debug_is_redacted() {
        let trust = trust_material();
        assert_eq!(format!("{:?}", trust), "TrustMaterial(<redacted>)");
    }
}
