//! In-memory directory used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{AccessMode, LdapConfig};
use crate::errors::{AuthError, Result};

use super::client::{DirectoryConnection, DirectoryEntry, SearchScope};

pub(crate) fn test_config() -> LdapConfig {
    LdapConfig {
        enabled: true,
        servers: vec!["ldap.foo.bar".into()],
        port: 389,
        tls: false,
        connection_timeout_secs: 5,
        service_account_dn: "cn=admin,dc=foo,dc=bar".into(),
        service_account_password: SecretString::from("adminpw".to_string()),
        service_account_bind_enabled: true,
        user_search_base: "ou=users,dc=foo,dc=bar".into(),
        group_search_base: Some("ou=groups,dc=foo,dc=bar".into()),
        user_object_class: "inetOrgPerson".into(),
        user_login_attribute: "uid".into(),
        user_name_attribute: "cn".into(),
        user_member_attribute: "memberOf".into(),
        user_search_attribute: "cn".into(),
        user_enabled_attribute: String::new(),
        user_disabled_bit_mask: 0,
        group_object_class: "groupOfNames".into(),
        group_name_attribute: "cn".into(),
        group_dn_attribute: "entryDN".into(),
        group_member_mapping_attribute: "member".into(),
        group_search_attribute: "cn".into(),
        nested_group_membership_enabled: true,
        access_mode: AccessMode::Unrestricted,
        allowed_principal_ids: Vec::new(),
    }
}

#[derive(Default)]
struct DirectoryState {
    entries: Vec<DirectoryEntry>,
    passwords: HashMap<String, String>,
    searches: AtomicUsize,
}

/// Shared fake directory; every [`FakeDirectory::connect`] call hands out
/// a connection over the same entry set.
#[derive(Clone, Default)]
pub(crate) struct FakeDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeDirectory {
    pub(crate) fn add_entry(&mut self, entry: DirectoryEntry) {
        self.state.lock().unwrap().entries.push(entry);
    }

    pub(crate) fn set_password(&mut self, dn: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .passwords
            .insert(dn.to_string(), password.to_string());
    }

    /// Record `child` in the `member` attribute of the entry at
    /// `parent`, wiring a parent-of edge for nested resolution.
    pub(crate) fn link_parent(&mut self, child: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        let parent = state
            .entries
            .iter_mut()
            .find(|e| e.dn == parent)
            .unwrap_or_else(|| panic!("no entry {parent}"));
        parent
            .attributes
            .entry("member".into())
            .or_default()
            .push(child.to_string());
    }

    pub(crate) fn connect(&self) -> FakeConnection {
        FakeConnection {
            state: Arc::clone(&self.state),
        }
    }
}

pub(crate) struct FakeConnection {
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeConnection {
    pub(crate) fn search_count(&self) -> usize {
        self.state.lock().unwrap().searches.load(Ordering::SeqCst)
    }
}

/// Extract the innermost `(attr=value)` terms of a filter, dropping the
/// objectClass term the real server would apply.
fn filter_terms(filter: &str) -> Vec<(String, String)> {
    let mut terms = Vec::new();
    let mut depth_start = None;
    let mut chars = filter.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '(' => depth_start = Some(i + 1),
            ')' => {
                if let Some(start) = depth_start.take() {
                    let term = &filter[start..i];
                    if let Some((attr, value)) = term.split_once('=') {
                        if !attr.eq_ignore_ascii_case("objectClass") {
                            terms.push((attr.to_string(), value.to_string()));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    terms
}

fn entry_matches(entry: &DirectoryEntry, attr: &str, value: &str) -> bool {
    let candidates: Vec<&str> = if attr == "entryDN" {
        vec![entry.dn.as_str()]
    } else {
        entry
            .attributes
            .get(attr)
            .map(|vs| vs.iter().map(String::as_str).collect())
            .unwrap_or_default()
    };
    if let Some(prefix) = value.strip_suffix('*') {
        candidates.iter().any(|c| c.starts_with(prefix))
    } else {
        candidates.contains(&value)
    }
}

#[async_trait]
impl DirectoryConnection for FakeConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        match state.passwords.get(dn) {
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err(AuthError::unauthorized()),
            None => Err(AuthError::unauthorized()),
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        _attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>> {
        let state = self.state.lock().unwrap();
        state.searches.fetch_add(1, Ordering::SeqCst);
        let terms = filter_terms(filter);
        Ok(state
            .entries
            .iter()
            .filter(|entry| match scope {
                SearchScope::Base => entry.dn == base,
                SearchScope::Subtree => entry.dn.ends_with(base),
            })
            .filter(|entry| {
                terms.is_empty() || terms.iter().any(|(a, v)| entry_matches(entry, a, v))
            })
            .cloned()
            .collect())
    }

    async fn unbind(&mut self) {}
}
