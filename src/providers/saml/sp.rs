//! Service-provider plumbing around `samael`.

use std::collections::HashMap;

use anyhow::anyhow;
use openssl::rsa::Rsa;
use openssl::x509::X509;
use samael::metadata::{EntityDescriptor, HTTP_REDIRECT_BINDING};
use samael::service_provider::{ServiceProvider, ServiceProviderBuilder};

use crate::config::SamlConfig;
use crate::errors::{AuthError, Result};

/// The subset of an accepted assertion the provider consumes.
#[derive(Debug, Default)]
pub struct ParsedAssertion {
    pub name_id: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
}

/// An AuthnRequest waiting for its relay state.
pub struct PendingLogin {
    request: samael::schema::AuthnRequest,
}

impl PendingLogin {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn redirect_url(&self, relay_state: &str) -> Result<String> {
        self.request
            .redirect(relay_state)
            .map_err(|err| AuthError::server(anyhow!("building redirect: {err}")))?
            .ok_or_else(|| AuthError::server(anyhow!("IdP endpoint produced no redirect URL")))
            .map(|url| url.to_string())
    }
}

/// A fully initialized SAML service provider for one provider name.
pub struct SpHandle {
    sp: ServiceProvider,
    sso_url: String,
}

impl SpHandle {
    pub fn from_config(name: &str, config: &SamlConfig) -> Result<Self> {
        let idp_metadata: EntityDescriptor =
            samael::metadata::de::from_str(&config.idp_metadata_xml)
                .map_err(|err| AuthError::server(anyhow!("parsing IdP metadata: {err}")))?;

        let sso_url = idp_metadata
            .idp_sso_descriptors
            .iter()
            .flatten()
            .flat_map(|descriptor| &descriptor.single_sign_on_services)
            .find(|endpoint| endpoint.binding == HTTP_REDIRECT_BINDING)
            .map(|endpoint| endpoint.location.clone())
            .ok_or_else(|| {
                AuthError::server(anyhow!("IdP metadata has no redirect-binding SSO endpoint"))
            })?;

        let key = Rsa::private_key_from_pem(config.sp_key_pem.as_bytes())
            .map_err(|err| AuthError::server(anyhow!("parsing SP key: {err}")))?;
        let certificate = X509::from_pem(config.sp_cert_pem.as_bytes())
            .map_err(|err| AuthError::server(anyhow!("parsing SP certificate: {err}")))?;

        let base = config.api_host.trim_end_matches('/');
        let sp = ServiceProviderBuilder::default()
            .entity_id(config.entity_id.clone())
            .key(key)
            .certificate(certificate)
            .idp_metadata(idp_metadata)
            .metadata_url(format!("{base}/{name}/saml/metadata"))
            .acs_url(format!("{base}/{name}/saml/acs"))
            .slo_url(format!("{base}/{name}/saml/acs"))
            .build()
            .map_err(|err| AuthError::server(anyhow!("building service provider: {err}")))?;

        Ok(Self { sp, sso_url })
    }

    pub fn metadata_xml(&self) -> Result<String> {
        self.sp
            .metadata()
            .map_err(|err| AuthError::server(anyhow!("building SP metadata: {err}")))?
            .to_xml()
            .map_err(|err| AuthError::server(anyhow!("serializing SP metadata: {err}")))
    }

    /// Build an AuthnRequest. The caller signs relay state over the
    /// request id before asking for the redirect URL.
    pub fn create_request(&self) -> Result<PendingLogin> {
        let request = self
            .sp
            .make_authentication_request(&self.sso_url)
            .map_err(|err| AuthError::server(anyhow!("building AuthnRequest: {err}")))?;
        Ok(PendingLogin { request })
    }

    /// Parse and validate a base64 SAMLResponse correlated to `request_id`.
    pub fn parse_response(&self, saml_response: &str, request_id: &str) -> Result<ParsedAssertion> {
        let assertion = self
            .sp
            .parse_base64_response(saml_response, Some(&[request_id]))
            .map_err(|err| AuthError::unauthorized_from(anyhow!("rejected assertion: {err}")))?;

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|subject| subject.name_id.as_ref())
            .map(|name_id| name_id.value.clone());

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        for statement in assertion.attribute_statements.iter().flatten() {
            for attribute in &statement.attributes {
                let Some(name) = attribute.name.clone() else {
                    continue;
                };
                let values = attribute
                    .values
                    .iter()
                    .filter_map(|v| v.value.clone())
                    .collect::<Vec<_>>();
                attributes.entry(name).or_default().extend(values);
            }
        }

        Ok(ParsedAssertion {
            name_id,
            attributes,
        })
    }
}
