//! Resolved identities (users and groups) from identity providers.
//!
//! A principal id is `<provider>_<kind>://<external_id>`, so provider and
//! kind can always be recovered from the id alone.

use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
}

impl PrincipalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

/// A resolved identity from some identity provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub login_name: String,
    pub kind: PrincipalKind,
    pub provider: String,
    /// Set on the principal that represents the authenticated caller.
    #[serde(default)]
    pub is_self: bool,
    /// Set on group principals the caller is a member of.
    #[serde(default)]
    pub is_member_of: bool,
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.provider == other.provider
    }
}

impl Eq for Principal {}

impl Principal {
    /// Build the id scope prefix for a provider and kind, e.g.
    /// `openldap_group`.
    #[must_use]
    pub fn scope(provider: &str, kind: PrincipalKind) -> String {
        format!("{provider}_{}", kind.as_str())
    }

    /// Format a full principal id from its parts.
    #[must_use]
    pub fn format_id(provider: &str, kind: PrincipalKind, external_id: &str) -> String {
        format!("{}://{external_id}", Self::scope(provider, kind))
    }

    /// Recover `(provider, kind, external_id)` from a principal id.
    pub fn parse_id(id: &str) -> Result<(String, PrincipalKind, String), AuthError> {
        let (scope, external_id) = id
            .split_once("://")
            .ok_or_else(|| AuthError::InvalidFormat(format!("principal id {id:?}")))?;
        let (provider, kind) = scope
            .rsplit_once('_')
            .ok_or_else(|| AuthError::InvalidFormat(format!("principal scope {scope:?}")))?;
        let kind = match kind {
            "user" => PrincipalKind::User,
            "group" => PrincipalKind::Group,
            other => {
                return Err(AuthError::InvalidFormat(format!(
                    "principal kind {other:?}"
                )))
            }
        };
        if provider.is_empty() || external_id.is_empty() {
            return Err(AuthError::InvalidFormat(format!("principal id {id:?}")));
        }
        Ok((provider.to_string(), kind, external_id.to_string()))
    }

    pub fn user(provider: &str, external_id: &str, display_name: &str, login_name: &str) -> Self {
        Self {
            id: Self::format_id(provider, PrincipalKind::User, external_id),
            display_name: display_name.to_string(),
            login_name: login_name.to_string(),
            kind: PrincipalKind::User,
            provider: provider.to_string(),
            is_self: true,
            is_member_of: false,
        }
    }

    pub fn group(provider: &str, external_id: &str, display_name: &str) -> Self {
        Self {
            id: Self::format_id(provider, PrincipalKind::Group, external_id),
            display_name: display_name.to_string(),
            login_name: display_name.to_string(),
            kind: PrincipalKind::Group,
            provider: provider.to_string(),
            is_self: false,
            is_member_of: true,
        }
    }
}

/// Append `candidates` to `groups`, skipping ids already present.
///
/// Group lists returned to the token layer must not contain duplicate ids;
/// every provider funnels its group principals through here.
pub fn append_deduplicated(groups: &mut Vec<Principal>, candidates: Vec<Principal>) {
    for candidate in candidates {
        if !groups.iter().any(|g| g.id == candidate.id) {
            groups.push(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        let id = Principal::format_id("openldap", PrincipalKind::User, "cn=alice,dc=foo,dc=bar");
        assert_eq!(id, "openldap_user://cn=alice,dc=foo,dc=bar");
        let (provider, kind, external) = Principal::parse_id(&id).unwrap();
        assert_eq!(provider, "openldap");
        assert_eq!(kind, PrincipalKind::User);
        assert_eq!(external, "cn=alice,dc=foo,dc=bar");
    }

    #[test]
    fn parse_id_rejects_malformed() {
        assert!(Principal::parse_id("no-separator").is_err());
        assert!(Principal::parse_id("nounderscore://x").is_err());
        assert!(Principal::parse_id("ldap_banana://x").is_err());
        assert!(Principal::parse_id("ldap_user://").is_err());
    }

    #[test]
    fn provider_with_underscore_in_name() {
        let (provider, kind, _) = Principal::parse_id("active_directory_group://cn=ops").unwrap();
        assert_eq!(provider, "active_directory");
        assert_eq!(kind, PrincipalKind::Group);
    }

    #[test]
    fn equality_ignores_display_fields() {
        let mut a = Principal::group("openldap", "cn=admins", "admins");
        let b = Principal::group("openldap", "cn=admins", "Administrators");
        a.display_name = "other".into();
        assert_eq!(a, b);
    }

    #[test]
    fn append_deduplicated_skips_known_ids() {
        let mut groups = vec![Principal::group("openldap", "cn=a", "a")];
        append_deduplicated(
            &mut groups,
            vec![
                Principal::group("openldap", "cn=a", "a"),
                Principal::group("openldap", "cn=b", "b"),
            ],
        );
        let ids: Vec<_> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["openldap_group://cn=a", "openldap_group://cn=b"]);
    }
}
