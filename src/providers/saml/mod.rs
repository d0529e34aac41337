//! SAML service-provider authentication.
//!
//! Login is a browser round trip: we issue an AuthnRequest with signed
//! relay state, the IdP posts an assertion back to the ACS endpoint, and
//! the assertion is only accepted when it correlates to a relay state we
//! issued and still hold outstanding.

pub mod endpoints;
pub mod relay;
pub mod sp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::SamlConfig;
use crate::errors::{AuthError, Result};
use crate::principal::{append_deduplicated, Principal, PrincipalKind};
use crate::providers::ldap::LdapProvider;
use crate::providers::{enforce_access, AuthenticatedPrincipal, Credential, PrincipalProvider};
use crate::tokens::Token;

use relay::RelayStates;
use sp::{ParsedAssertion, SpHandle};

/// Cookie carrying the relay token across the IdP round trip; scoped to
/// the ACS path so it never rides along on other requests.
pub const RELAY_COOKIE_NAME: &str = "armada_saml_rs";

/// Everything a login handler needs to bounce the browser to the IdP.
pub struct LoginRedirect {
    pub idp_redirect_url: String,
    pub relay_cookie: String,
}

struct ReadySp {
    resource_version: String,
    handle: Arc<SpHandle>,
}

pub struct SamlProvider {
    name: String,
    config: SamlConfig,
    relays: RelayStates,
    state: tokio::sync::Mutex<Option<ReadySp>>,
    ldap_delegate: Option<LdapProvider>,
}

impl SamlProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, config: SamlConfig) -> Self {
        let name = name.into();
        // An embedded directory that is present but disabled counts as
        // not configured; group operations then fall back to
        // assertion-derived results.
        let ldap_delegate = config
            .ldap_group_search
            .clone()
            .filter(|ldap| ldap.enabled)
            .map(|ldap| LdapProvider::new(name.clone(), ldap));
        Self::with_delegate(name, config, ldap_delegate)
    }

    #[must_use]
    pub fn with_delegate(
        name: impl Into<String>,
        config: SamlConfig,
        ldap_delegate: Option<LdapProvider>,
    ) -> Self {
        let relays = RelayStates::new(config.relay_state_key.clone(), config.relay_state_ttl());
        Self {
            name: name.into(),
            config,
            relays,
            state: tokio::sync::Mutex::new(None),
            ldap_delegate,
        }
    }

    /// Initialize the service provider for the current config version.
    /// Re-entry at an unchanged `resource_version` is a no-op.
    async fn ensure_ready(&self) -> Result<Arc<SpHandle>> {
        let mut state = self.state.lock().await;
        if let Some(ready) = state.as_ref() {
            if ready.resource_version == self.config.resource_version {
                return Ok(Arc::clone(&ready.handle));
            }
        }
        let handle = Arc::new(SpHandle::from_config(&self.name, &self.config)?);
        info!(
            provider = %self.name,
            resource_version = %self.config.resource_version,
            "initialized SAML service provider"
        );
        *state = Some(ReadySp {
            resource_version: self.config.resource_version.clone(),
            handle: Arc::clone(&handle),
        });
        Ok(handle)
    }

    pub async fn metadata_xml(&self) -> Result<String> {
        self.ensure_ready().await?.metadata_xml()
    }

    /// Start a login: build the AuthnRequest, sign relay state over its
    /// id, and hand back the IdP redirect plus the relay cookie.
    pub async fn begin_login(&self) -> Result<LoginRedirect> {
        let handle = self.ensure_ready().await?;
        let pending = handle.create_request()?;
        let relay = self
            .relays
            .issue(pending.id(), &self.config.final_redirect_url)?;
        let idp_redirect_url = pending.redirect_url(&relay)?;
        let relay_cookie = format!(
            "{RELAY_COOKIE_NAME}={relay}; Path=/{}/saml/acs; HttpOnly; Secure",
            self.name
        );
        Ok(LoginRedirect {
            idp_redirect_url,
            relay_cookie,
        })
    }

    /// Consume an ACS callback. Returns the authenticated principal and
    /// the redirect the browser should land on.
    pub async fn handle_assertion(
        &self,
        saml_response: &str,
        relay_state: &str,
    ) -> Result<(AuthenticatedPrincipal, String)> {
        let claims = self.relays.redeem(relay_state)?;
        let handle = self.ensure_ready().await?;
        let parsed = handle.parse_response(saml_response, &claims.request_id)?;

        let (user, groups) = principals_from_assertion(&self.name, &self.config, &parsed)?;
        enforce_access(
            self.config.access_mode,
            &self.config.allowed_principal_ids,
            &user,
            &groups,
        )?;
        Ok((
            AuthenticatedPrincipal {
                user,
                groups,
                provider_info: HashMap::new(),
            },
            claims.redirect_uri,
        ))
    }
}

/// Map assertion attributes into principals using the configured field
/// names. Unmapped attributes are ignored.
fn principals_from_assertion(
    provider: &str,
    config: &SamlConfig,
    parsed: &ParsedAssertion,
) -> Result<(Principal, Vec<Principal>)> {
    let first = |field: &str| -> Option<&str> {
        if field.is_empty() {
            return None;
        }
        parsed
            .attributes
            .get(field)
            .and_then(|values| values.first())
            .map(String::as_str)
    };

    let uid = first(&config.uid_field)
        .or(parsed.name_id.as_deref())
        .ok_or_else(|| {
            AuthError::unauthorized_from(anyhow::anyhow!(
                "assertion carries neither {} nor a NameID",
                config.uid_field
            ))
        })?;
    let display = first(&config.display_name_field).unwrap_or(uid);
    let login = first(&config.user_name_field).unwrap_or(uid);
    let user = Principal::user(provider, uid, display, login);

    let mut groups = Vec::new();
    if !config.groups_field.is_empty() {
        if let Some(values) = parsed.attributes.get(&config.groups_field) {
            append_deduplicated(
                &mut groups,
                values
                    .iter()
                    .map(|value| Principal::group(provider, value, value))
                    .collect(),
            );
        }
    }
    Ok((user, groups))
}

#[async_trait]
impl PrincipalProvider for SamlProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal> {
        let Credential::SamlResponse {
            saml_response,
            relay_state,
        } = credential
        else {
            return Err(AuthError::unauthorized());
        };
        let (authenticated, _) = self.handle_assertion(&saml_response, &relay_state).await?;
        Ok(authenticated)
    }

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        caller: &Token,
    ) -> Result<Vec<Principal>> {
        if let Some(delegate) = &self.ldap_delegate {
            return delegate.search_principals(query, kind, caller).await;
        }
        // Without a directory there is nothing to search; echo the query
        // back as a candidate principal of each requested kind.
        let mut principals = Vec::new();
        if kind.is_none() || kind == Some(PrincipalKind::User) {
            principals.push(Principal::user(&self.name, query, query, query));
        }
        if kind.is_none() || kind == Some(PrincipalKind::Group) {
            principals.push(Principal::group(&self.name, query, query));
        }
        Ok(principals)
    }

    async fn get_principal(&self, id: &str, caller: &Token) -> Result<Principal> {
        if let Some(delegate) = &self.ldap_delegate {
            return delegate.get_principal(id, caller).await;
        }
        let (provider, kind, external_id) = Principal::parse_id(id)?;
        if provider != self.name {
            return Err(AuthError::InvalidFormat(format!("principal id {id:?}")));
        }
        Ok(match kind {
            PrincipalKind::User => {
                Principal::user(&self.name, &external_id, &external_id, &external_id)
            }
            PrincipalKind::Group => Principal::group(&self.name, &external_id, &external_id),
        })
    }
}
