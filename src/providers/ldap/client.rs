//! Directory connection handling.
//!
//! Every directory operation acquires its own connection, runs a fixed
//! bind/search sequence and unbinds on every exit path. Connections are
//! never reused across requests.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tracing::debug;

use crate::config::LdapConfig;
use crate::errors::{AuthError, Result};

pub use ldap3::{dn_escape, ldap_escape};

/// LDAP result code for a bind with wrong credentials.
const RC_INVALID_CREDENTIALS: u32 = 49;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    Subtree,
}

/// A single entry returned from a directory search.
#[derive(Clone, Debug, Default)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// First value of an attribute, if present and non-empty.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(attribute)
            .map_or(&[], Vec::as_slice)
    }
}

/// One live, bindable directory connection.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Bind as `dn`. Wrong credentials map to `Unauthorized`; any other
    /// failure maps to `ServerError`.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>>;

    /// Best-effort unbind. Callers invoke this on every exit path.
    async fn unbind(&mut self);
}

/// Dials fresh connections for [`DirectoryConnection`] consumers.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>>;
}

/// [`DirectoryConnector`] backed by `ldap3`.
pub struct Ldap3Connector {
    servers: Vec<String>,
    port: u16,
    tls: bool,
    timeout: std::time::Duration,
}

impl Ldap3Connector {
    #[must_use]
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            port: config.port,
            tls: config.tls,
            timeout: config.connection_timeout(),
        }
    }

    fn urls(&self) -> impl Iterator<Item = String> + '_ {
        let scheme = if self.tls { "ldaps" } else { "ldap" };
        self.servers
            .iter()
            .map(move |server| format!("{scheme}://{server}:{}", self.port))
    }
}

#[async_trait]
impl DirectoryConnector for Ldap3Connector {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>> {
        let mut last_err = anyhow!("no directory servers configured");
        for url in self.urls() {
            let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
            match LdapConnAsync::with_settings(settings, &url).await {
                Ok((conn, ldap)) => {
                    ldap3::drive!(conn);
                    return Ok(Box::new(Ldap3Connection { ldap }));
                }
                Err(err) => {
                    debug!("directory dial failed for {url}: {err}");
                    last_err = anyhow!(err).context(format!("dialing {url}"));
                }
            }
        }
        Err(AuthError::ServerError(last_err))
    }
}

struct Ldap3Connection {
    ldap: ldap3::Ldap,
}

#[async_trait]
impl DirectoryConnection for Ldap3Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let result = self
            .ldap
            .simple_bind(dn, password)
            .await
            .map_err(|err| AuthError::server(anyhow!(err).context("directory bind")))?;
        match result.rc {
            0 => Ok(()),
            RC_INVALID_CREDENTIALS => Err(AuthError::unauthorized()),
            rc => Err(AuthError::server(anyhow!(
                "directory bind returned result code {rc}: {}",
                result.text
            ))),
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>> {
        let scope = match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let (entries, _) = self
            .ldap
            .search(base, scope, filter, attributes.to_vec())
            .await
            .map_err(|err| AuthError::server(anyhow!(err).context("directory search")))?
            .success()
            .map_err(|err| AuthError::server(anyhow!(err).context("directory search")))?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                DirectoryEntry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                }
            })
            .collect())
    }

    async fn unbind(&mut self) {
        if let Err(err) = self.ldap.unbind().await {
            debug!("directory unbind failed: {err}");
        }
    }
}
