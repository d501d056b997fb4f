//! SAML Service Provider implementation.
//!
//! Builds signed AuthnRequests for the HTTP-Redirect binding and verifies
//! IdP responses. XML parsing, signature checks, audience, issuer and timing
//! validation are all delegated to `samael`.

use anyhow::{anyhow, Result};
use openssl::x509::X509;
use samael::metadata::{Endpoint, EntityDescriptor, IdpSsoDescriptor, HTTP_REDIRECT_BINDING};
use samael::schema::Assertion;
use samael::service_provider::{self, ServiceProvider, ServiceProviderBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::config::SamlConfig;
use super::credentials::TrustMaterial;
use super::metadata::{key_descriptor, SAML2_PROTOCOL};
use super::verifier::{AssertionVerifier, VerificationError};
use crate::session::UserProfile;

/// Redirect to the IdP for one AuthnRequest.
#[derive(Debug, Clone)]
pub struct AuthnRedirect {
    /// AuthnRequest ID, echoed by the IdP as `InResponseTo`.
    pub request_id: String,
    /// Full IdP URL including `SAMLRequest`, `RelayState` and signature.
    pub location: String,
}

/// SAML Service Provider bound to one IdP.
pub struct SamlProvider {
    config: Arc<SamlConfig>,
    trust: Arc<TrustMaterial>,
    idp_metadata: EntityDescriptor,
}

impl SamlProvider {
    /// Create a provider. Fails if the config is invalid or samael rejects
    /// the resulting Service Provider.
    pub fn new(config: Arc<SamlConfig>, trust: Arc<TrustMaterial>) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;
        let idp_metadata = build_idp_metadata(&config, &trust);

        let provider = Self {
            config,
            trust,
            idp_metadata,
        };
        provider
            .service_provider(&provider.trust)
            .map_err(|e| anyhow!("Failed to build ServiceProvider: {}", e))?;

        Ok(provider)
    }

    /// Create a signed AuthnRequest and return the redirect to the IdP.
    pub fn create_authn_request(&self, relay_state: &str) -> Result<AuthnRedirect> {
        let sp = self
            .service_provider(&self.trust)
            .map_err(|e| anyhow!("Failed to build ServiceProvider: {}", e))?;

        let authn_request = sp
            .make_authentication_request(&self.config.idp_sso_url)
            .map_err(|e| anyhow!("Failed to create AuthnRequest: {}", e))?;
        let request_id = authn_request.id.clone();

        let url = authn_request
            .signed_redirect(relay_state, self.trust.signing_key.clone())
            .map_err(|e| anyhow!("Failed to sign AuthnRequest: {}", e))?
            .ok_or_else(|| anyhow!("AuthnRequest has no destination"))?;

        debug!(request_id = %request_id, "Created SAML AuthnRequest redirect");

        Ok(AuthnRedirect {
            request_id,
            location: url.to_string(),
        })
    }

    /// The decryption key lets samael open `EncryptedAssertion`s.
    fn service_provider(&self, trust: &TrustMaterial) -> Result<ServiceProvider, String> {
        let decryption_cert = X509::from_der(trust.decryption_cert.der())
            .map_err(|e| format!("SP decryption certificate: {}", e))?;

        ServiceProviderBuilder::default()
            .entity_id(self.config.entity_id.clone())
            .acs_url(self.config.callback_url.clone())
            .idp_metadata(self.idp_metadata.clone())
            .key(trust.decryption_key.clone())
            .certificate(decryption_cert)
            .authn_name_id_format(self.config.name_id_format.clone())
            .allow_idp_initiated(false)
            .max_issue_delay(chrono::Duration::seconds(self.config.max_issue_delay_secs))
            .build()
            .map_err(|e| e.to_string())
    }
}

impl AssertionVerifier for SamlProvider {
    fn verify(
        &self,
        saml_response: &str,
        request_id: &str,
        trust: &TrustMaterial,
    ) -> Result<UserProfile, VerificationError> {
        // Form posts may wrap the base64 payload.
        let encoded: String = saml_response
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();

        debug!(request_id = %request_id, "Processing SAML response");

        let sp = self
            .service_provider(trust)
            .map_err(VerificationError::Rejected)?;

        let assertion = sp
            .parse_base64_response(&encoded, Some(&[request_id]))
            .map_err(|e| {
                if e.downcast_ref::<service_provider::Error>().is_some() {
                    VerificationError::Rejected(e.to_string())
                } else {
                    VerificationError::Malformed(e.to_string())
                }
            })?;

        let profile = profile_from_assertion(&assertion)?;

        info!(
            name_id = %profile.name_id,
            idp = %profile.issuer,
            attributes = profile.attributes.len(),
            "SAML assertion validated"
        );

        Ok(profile)
    }
}

/// IdP metadata from the configured entity ID, SSO URL and certificate.
fn build_idp_metadata(config: &SamlConfig, trust: &TrustMaterial) -> EntityDescriptor {
    let idp_descriptor = IdpSsoDescriptor {
        id: None,
        valid_until: None,
        cache_duration: None,
        protocol_support_enumeration: Some(SAML2_PROTOCOL.to_string()),
        error_url: None,
        signature: None,
        key_descriptors: vec![key_descriptor("signing", &trust.idp_cert)],
        organization: None,
        contact_people: vec![],
        artifact_resolution_service: vec![],
        single_logout_services: vec![],
        manage_name_id_services: vec![],
        name_id_formats: vec![],
        want_authn_requests_signed: None,
        single_sign_on_services: vec![Endpoint {
            binding: HTTP_REDIRECT_BINDING.to_string(),
            location: config.idp_sso_url.clone(),
            response_location: None,
        }],
        name_id_mapping_services: vec![],
        assertion_id_request_services: vec![],
        attribute_profiles: vec![],
        attributes: vec![],
    };

    EntityDescriptor {
        entity_id: Some(config.idp_entity_id.clone()),
        idp_sso_descriptors: Some(vec![idp_descriptor]),
        ..Default::default()
    }
}

/// Extract the user profile from a verified assertion.
fn profile_from_assertion(assertion: &Assertion) -> Result<UserProfile, VerificationError> {
    let name_id = assertion
        .subject
        .as_ref()
        .and_then(|s| s.name_id.as_ref())
        .ok_or(VerificationError::MissingSubject)?;

    let session_index = assertion
        .authn_statements
        .as_ref()
        .and_then(|stmts| stmts.first())
        .and_then(|s| s.session_index.clone());

    let issuer = assertion
        .issuer
        .value
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(ref attr_statements) = assertion.attribute_statements {
        for attr_statement in attr_statements {
            for attr in &attr_statement.attributes {
                if let Some(ref name) = attr.name {
                    let values: Vec<String> = attr
                        .values
                        .iter()
                        .filter_map(|v| v.value.clone())
                        .collect();
                    if !values.is_empty() {
                        attributes.entry(name.clone()).or_default().extend(values);
                    }
                }
            }
        }
    }

    Ok(UserProfile {
        name_id: name_id.value.clone(),
        name_id_format: name_id.format.clone(),
        issuer,
        assertion_id: assertion.id.clone(),
        session_index,
        attributes,
    })
}
