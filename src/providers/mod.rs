//! Pluggable identity providers.
//!
//! Four variants resolve external identities: local password, LDAP/AD,
//! SAML, and AzureAD. Dispatch is a tagged enum over concrete types; the
//! trait is sealed so embedders cannot add variants the token layer has
//! never been audited against.

pub mod azuread;
pub mod ldap;
pub mod local;
pub mod saml;

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;

use crate::config::AccessMode;
use crate::errors::{AuthError, Result};
use crate::principal::{Principal, PrincipalKind};
use crate::tokens::Token;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::local::LocalProvider {}
    impl Sealed for super::ldap::LdapProvider {}
    impl Sealed for super::saml::SamlProvider {}
    impl Sealed for super::azuread::AzureAdProvider {}
    impl Sealed for super::AuthProvider {}
}

/// Credential presented to a provider's `authenticate`.
#[derive(Clone)]
pub enum Credential {
    Basic {
        username: String,
        password: SecretString,
    },
    /// SAML response document plus the relay state returned by the IdP.
    SamlResponse {
        saml_response: String,
        relay_state: String,
    },
    /// OAuth2 authorization code from the AzureAD redirect.
    OAuthCode { code: String },
}

/// Outcome of a successful authentication.
#[derive(Clone, Debug)]
pub struct AuthenticatedPrincipal {
    pub user: Principal,
    pub groups: Vec<Principal>,
    /// Opaque provider session data stored on the token, e.g. an OAuth
    /// access token.
    pub provider_info: HashMap<String, String>,
}

#[async_trait]
pub trait PrincipalProvider: sealed::Sealed + Send + Sync {
    fn provider_name(&self) -> &str;

    /// Authenticate a credential, returning the user principal and its
    /// deduplicated group principals.
    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal>;

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        caller: &Token,
    ) -> Result<Vec<Principal>>;

    async fn get_principal(&self, id: &str, caller: &Token) -> Result<Principal>;
}

/// Tagged dispatch over the four provider variants.
pub enum AuthProvider {
    Local(local::LocalProvider),
    Ldap(ldap::LdapProvider),
    Saml(saml::SamlProvider),
    AzureAd(azuread::AzureAdProvider),
}

#[async_trait]
impl PrincipalProvider for AuthProvider {
    fn provider_name(&self) -> &str {
        match self {
            Self::Local(p) => p.provider_name(),
            Self::Ldap(p) => p.provider_name(),
            Self::Saml(p) => p.provider_name(),
            Self::AzureAd(p) => p.provider_name(),
        }
    }

    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal> {
        match self {
            Self::Local(p) => p.authenticate(credential).await,
            Self::Ldap(p) => p.authenticate(credential).await,
            Self::Saml(p) => p.authenticate(credential).await,
            Self::AzureAd(p) => p.authenticate(credential).await,
        }
    }

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        caller: &Token,
    ) -> Result<Vec<Principal>> {
        match self {
            Self::Local(p) => p.search_principals(query, kind, caller).await,
            Self::Ldap(p) => p.search_principals(query, kind, caller).await,
            Self::Saml(p) => p.search_principals(query, kind, caller).await,
            Self::AzureAd(p) => p.search_principals(query, kind, caller).await,
        }
    }

    async fn get_principal(&self, id: &str, caller: &Token) -> Result<Principal> {
        match self {
            Self::Local(p) => p.get_principal(id, caller).await,
            Self::Ldap(p) => p.get_principal(id, caller).await,
            Self::Saml(p) => p.get_principal(id, caller).await,
            Self::AzureAd(p) => p.get_principal(id, caller).await,
        }
    }
}

/// Explicit provider registry built once at startup and passed by
/// reference into request handlers. Never a process-wide mutable map.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, AuthProvider>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: AuthProvider) {
        self.providers
            .insert(provider.provider_name().to_string(), provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AuthProvider> {
        self.providers.get(name)
    }

    /// Resolve the provider owning a principal id via its scope prefix.
    pub fn provider_for_principal(&self, principal_id: &str) -> Result<&AuthProvider> {
        let (provider, _, _) = Principal::parse_id(principal_id)?;
        self.get(&provider)
            .ok_or_else(|| AuthError::NotFound(format!("provider {provider}")))
    }
}

/// Evaluate the access-mode allow-list for an authenticated identity.
///
/// `Restricted` and `Required` both demand that the user or one of its
/// groups appears on the allow-list; `Restricted` additionally accepts ids
/// granted out-of-band (cluster or project membership), supplied by the
/// embedder through `extra_allowed`.
#[must_use]
pub fn check_access(
    mode: AccessMode,
    allowed_principal_ids: &[String],
    user_principal_id: &str,
    groups: &[Principal],
    extra_allowed: &[String],
) -> bool {
    match mode {
        AccessMode::Unrestricted => true,
        AccessMode::Required | AccessMode::Restricted => {
            if allowed_principal_ids.iter().any(|id| id == user_principal_id) {
                return true;
            }
            if groups
                .iter()
                .any(|group| allowed_principal_ids.iter().any(|id| *id == group.id))
            {
                return true;
            }
            if mode == AccessMode::Restricted {
                return extra_allowed
                    .iter()
                    .any(|id| id == user_principal_id || groups.iter().any(|g| g.id == *id));
            }
            false
        }
    }
}

/// Deny unless `check_access` passes; shared by every provider's login.
pub(crate) fn enforce_access(
    mode: AccessMode,
    allowed_principal_ids: &[String],
    user: &Principal,
    groups: &[Principal],
) -> Result<()> {
    if check_access(mode, allowed_principal_ids, &user.id, groups, &[]) {
        Ok(())
    } else {
        Err(AuthError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str) -> Principal {
        Principal::group("openldap", id, id)
    }

    #[test]
    fn unrestricted_allows_everyone() {
        assert!(check_access(
            AccessMode::Unrestricted,
            &[],
            "openldap_user://cn=alice",
            &[],
            &[],
        ));
    }

    #[test]
    fn required_checks_user_and_groups() {
        let allowed = vec!["openldap_group://cn=admins".to_string()];
        let groups = vec![group("cn=admins")];
        assert!(check_access(
            AccessMode::Required,
            &allowed,
            "openldap_user://cn=alice",
            &groups,
            &[],
        ));
        assert!(!check_access(
            AccessMode::Required,
            &allowed,
            "openldap_user://cn=alice",
            &[group("cn=devs")],
            &[],
        ));
    }

    #[test]
    fn restricted_accepts_out_of_band_grants() {
        assert!(check_access(
            AccessMode::Restricted,
            &[],
            "openldap_user://cn=alice",
            &[],
            &["openldap_user://cn=alice".to_string()],
        ));
        assert!(!check_access(
            AccessMode::Restricted,
            &[],
            "openldap_user://cn=alice",
            &[],
            &[],
        ));
    }
}
