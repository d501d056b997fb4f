//! Service Provider metadata document.

use anyhow::{anyhow, Result};
use samael::key_info::{KeyInfo, X509Data};
use samael::metadata::{
    EntityDescriptor, IndexedEndpoint, KeyDescriptor, SpSsoDescriptor, HTTP_POST_BINDING,
};
use samael::traits::ToXml;

use super::config::SamlConfig;
use super::credentials::{Certificate, TrustMaterial};

pub(crate) const SAML2_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";

/// Render the SP `EntityDescriptor`: signing and encryption certificates,
/// NameID format and the ACS endpoint (HTTP-POST binding).
pub fn generate(config: &SamlConfig, trust: &TrustMaterial) -> Result<String> {
    let sp_descriptor = SpSsoDescriptor {
        protocol_support_enumeration: Some(SAML2_PROTOCOL.to_string()),
        key_descriptors: Some(vec![
            key_descriptor("signing", &trust.signing_cert),
            key_descriptor("encryption", &trust.decryption_cert),
        ]),
        name_id_formats: Some(vec![config.name_id_format.clone()]),
        authn_requests_signed: Some(true),
        want_assertions_signed: Some(true),
        assertion_consumer_services: vec![IndexedEndpoint {
            binding: HTTP_POST_BINDING.to_string(),
            location: config.callback_url.clone(),
            response_location: None,
            index: 1,
            is_default: Some(true),
        }],
        ..Default::default()
    };

    let entity_descriptor = EntityDescriptor {
        entity_id: Some(config.entity_id.clone()),
        sp_sso_descriptors: Some(vec![sp_descriptor]),
        ..Default::default()
    };

    entity_descriptor
        .to_string()
        .map_err(|e| anyhow!("Failed to serialize SP metadata: {}", e))
}

pub(crate) fn key_descriptor(key_use: &str, cert: &Certificate) -> KeyDescriptor {
    KeyDescriptor {
        key_use: Some(key_use.to_string()),
        key_info: KeyInfo {
            id: None,
            x509_data: Some(X509Data {
                certificates: vec![cert.base64_der()],
            }),
        },
        encryption_methods: None,
    }
}
