//! LDAP and Active Directory authentication.
//!
//! Login runs a fixed bind sequence: service-account bind, user lookup
//! by login attribute, a bind as the resolved user DN, then group
//! resolution under the service account again. An ambiguous lookup
//! (anything but exactly one entry) is a hard failure.

pub mod client;
pub mod membership;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::future::Future;

use anyhow::anyhow;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::LdapConfig;
use crate::errors::{AuthError, Result};
use crate::principal::{append_deduplicated, Principal, PrincipalKind};
use crate::providers::{enforce_access, AuthenticatedPrincipal, Credential, PrincipalProvider};
use crate::tokens::Token;

use client::{
    dn_escape, ldap_escape, DirectoryConnection, DirectoryConnector, DirectoryEntry, SearchScope,
};

pub const OPENLDAP: &str = "openldap";
pub const ACTIVE_DIRECTORY: &str = "activedirectory";

pub struct LdapProvider {
    name: String,
    config: LdapConfig,
    connector: Box<dyn DirectoryConnector>,
}

impl LdapProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, config: LdapConfig) -> Self {
        let connector = Box::new(client::Ldap3Connector::new(&config));
        Self::with_connector(name, config, connector)
    }

    #[must_use]
    pub fn with_connector(
        name: impl Into<String>,
        config: LdapConfig,
        connector: Box<dyn DirectoryConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            connector,
        }
    }

    /// Bound on any single directory operation, dial included. A hung
    /// server surfaces as `ServerError`, never `Unauthorized`.
    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::time::timeout(self.config.connection_timeout(), op)
            .await
            .map_err(|_| AuthError::server(anyhow!("directory operation deadline exceeded")))?
    }

    async fn bind_service_account(&self, conn: &mut dyn DirectoryConnection) -> Result<()> {
        conn.bind(
            &self.config.service_account_dn,
            self.config.service_account_password.expose_secret(),
        )
        .await
        .map_err(|err| match err {
            // A rejected service credential is an operator problem, not
            // a statement about the login attempt.
            AuthError::Unauthorized(_) => {
                AuthError::server(anyhow!("service account bind rejected"))
            }
            other => other,
        })
    }

    fn user_attributes(&self) -> Vec<String> {
        let mut attrs = vec![
            self.config.user_login_attribute.clone(),
            self.config.user_name_attribute.clone(),
            self.config.user_member_attribute.clone(),
        ];
        if !self.config.user_enabled_attribute.is_empty() {
            attrs.push(self.config.user_enabled_attribute.clone());
        }
        attrs
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthenticatedPrincipal> {
        let mut conn = self.connector.connect().await?;
        let result = self.login_on(conn.as_mut(), username, password).await;
        conn.unbind().await;
        result
    }

    async fn login_on(
        &self,
        conn: &mut dyn DirectoryConnection,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedPrincipal> {
        if self.config.service_account_bind_enabled {
            self.bind_service_account(conn).await?;
        } else {
            // No service account: search under the user's own credential,
            // bound at a DN constructed from the login attribute. DN
            // composition needs RDN escaping, not filter escaping.
            let bind_dn = format!(
                "{}={},{}",
                self.config.user_login_attribute,
                dn_escape(username),
                self.config.user_search_base
            );
            conn.bind(&bind_dn, password).await?;
        }

        let filter = format!(
            "(&(objectClass={})({}={}))",
            ldap_escape(&self.config.user_object_class),
            self.config.user_login_attribute,
            ldap_escape(username)
        );
        let mut entries = conn
            .search(
                &self.config.user_search_base,
                SearchScope::Subtree,
                &filter,
                &self.user_attributes(),
            )
            .await?;
        if entries.len() != 1 {
            debug!(
                count = entries.len(),
                "login lookup did not resolve to exactly one entry"
            );
            return Err(AuthError::unauthorized());
        }
        let user_entry = entries.remove(0);

        conn.bind(&user_entry.dn, password).await?;

        if self.config.service_account_bind_enabled {
            self.bind_service_account(conn).await?;
        }
        let member_dns = user_entry
            .values(&self.config.user_member_attribute)
            .to_vec();
        let mut group_entries =
            membership::resolve_direct_groups(conn, &self.config, &member_dns).await?;
        if self.config.nested_group_membership_enabled {
            group_entries =
                membership::resolve_nested_groups(conn, &self.config, group_entries).await?;
        }

        self.check_account_enabled(&user_entry)?;

        let user = self.user_principal(&user_entry);
        let mut groups = Vec::new();
        append_deduplicated(
            &mut groups,
            group_entries
                .iter()
                .map(|entry| self.group_principal(entry))
                .collect(),
        );
        enforce_access(
            self.config.access_mode,
            &self.config.allowed_principal_ids,
            &user,
            &groups,
        )?;

        Ok(AuthenticatedPrincipal {
            user,
            groups,
            provider_info: HashMap::new(),
        })
    }

    /// Directory "account disabled" bit check.
    fn check_account_enabled(&self, entry: &DirectoryEntry) -> Result<()> {
        let attribute = &self.config.user_enabled_attribute;
        let mask = self.config.user_disabled_bit_mask;
        if attribute.is_empty() || mask == 0 {
            return Ok(());
        }
        if let Some(raw) = entry.first(attribute) {
            let bits: i64 = raw.trim().parse().map_err(|_| {
                AuthError::InvalidFormat(format!("{attribute} value {raw:?} is not numeric"))
            })?;
            if bits & mask != 0 {
                return Err(AuthError::PermissionDenied);
            }
        }
        Ok(())
    }

    fn user_principal(&self, entry: &DirectoryEntry) -> Principal {
        let login = entry
            .first(&self.config.user_login_attribute)
            .unwrap_or(&entry.dn);
        let display = entry
            .first(&self.config.user_name_attribute)
            .unwrap_or(login);
        Principal::user(&self.name, &entry.dn, display, login)
    }

    fn group_principal(&self, entry: &DirectoryEntry) -> Principal {
        let display = entry
            .first(&self.config.group_name_attribute)
            .unwrap_or(&entry.dn);
        Principal::group(&self.name, &entry.dn, display)
    }

    async fn search(&self, query: &str, kind: Option<PrincipalKind>) -> Result<Vec<Principal>> {
        let mut conn = self.connector.connect().await?;
        let result = self.search_on(conn.as_mut(), query, kind).await;
        conn.unbind().await;
        result
    }

    async fn search_on(
        &self,
        conn: &mut dyn DirectoryConnection,
        query: &str,
        kind: Option<PrincipalKind>,
    ) -> Result<Vec<Principal>> {
        if self.config.service_account_bind_enabled {
            self.bind_service_account(conn).await?;
        }
        let mut principals = Vec::new();
        if kind.is_none() || kind == Some(PrincipalKind::User) {
            let attribute = non_empty_or(
                &self.config.user_search_attribute,
                &self.config.user_login_attribute,
            );
            let filter = format!(
                "(&(objectClass={})({attribute}={}*))",
                ldap_escape(&self.config.user_object_class),
                ldap_escape(query)
            );
            let entries = conn
                .search(
                    &self.config.user_search_base,
                    SearchScope::Subtree,
                    &filter,
                    &self.user_attributes(),
                )
                .await?;
            principals.extend(entries.iter().map(|e| self.user_principal(e)));
        }
        if kind.is_none() || kind == Some(PrincipalKind::Group) {
            let attribute = non_empty_or(
                &self.config.group_search_attribute,
                &self.config.group_name_attribute,
            );
            let filter = format!(
                "(&(objectClass={})({attribute}={}*))",
                ldap_escape(&self.config.group_object_class),
                ldap_escape(query)
            );
            let base = self
                .config
                .group_search_base
                .as_deref()
                .unwrap_or(&self.config.user_search_base);
            let entries = conn
                .search(
                    base,
                    SearchScope::Subtree,
                    &filter,
                    &[self.config.group_name_attribute.clone()],
                )
                .await?;
            append_deduplicated(
                &mut principals,
                entries.iter().map(|e| self.group_principal(e)).collect(),
            );
        }
        Ok(principals)
    }

    async fn lookup(&self, id: &str) -> Result<Principal> {
        let (provider, kind, dn) = Principal::parse_id(id)?;
        if provider != self.name {
            return Err(AuthError::InvalidFormat(format!("principal id {id:?}")));
        }
        let mut conn = self.connector.connect().await?;
        let result = self.lookup_on(conn.as_mut(), kind, &dn).await;
        conn.unbind().await;
        result
    }

    async fn lookup_on(
        &self,
        conn: &mut dyn DirectoryConnection,
        kind: PrincipalKind,
        dn: &str,
    ) -> Result<Principal> {
        if self.config.service_account_bind_enabled {
            self.bind_service_account(conn).await?;
        }
        let attributes = match kind {
            PrincipalKind::User => self.user_attributes(),
            PrincipalKind::Group => vec![self.config.group_name_attribute.clone()],
        };
        let mut entries = conn
            .search(dn, SearchScope::Base, "(objectClass=*)", &attributes)
            .await?;
        // Only directory-backed principals are accepted; a DN the
        // directory cannot produce an entry for is not resolved.
        let entry = match entries.len() {
            1 => entries.remove(0),
            _ => return Err(AuthError::NotFound("principal".into())),
        };
        Ok(match kind {
            PrincipalKind::User => self.user_principal(&entry),
            PrincipalKind::Group => self.group_principal(&entry),
        })
    }
}

fn non_empty_or<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

#[async_trait]
impl PrincipalProvider for LdapProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal> {
        let Credential::Basic { username, password } = credential else {
            return Err(AuthError::unauthorized());
        };
        // Many directories treat a bind with an empty password as an
        // anonymous bind that succeeds.
        if password.expose_secret().is_empty() {
            return Err(AuthError::unauthorized());
        }
        self.with_deadline(self.login(&username, password.expose_secret()))
            .await
    }

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        _caller: &Token,
    ) -> Result<Vec<Principal>> {
        self.with_deadline(self.search(query, kind)).await
    }

    async fn get_principal(&self, id: &str, _caller: &Token) -> Result<Principal> {
        self.with_deadline(self.lookup(id)).await
    }
}
