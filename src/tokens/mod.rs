//! Session tokens and their lifecycle.

pub mod manager;
pub mod purge;
pub mod request;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::principal::Principal;

/// Label carrying the owning user id, used for list-by-label lookups.
pub const USER_ID_LABEL: &str = "authn.armada.io/token-user-id";
/// Label distinguishing login sessions from derived and kubeconfig tokens.
pub const TOKEN_KIND_LABEL: &str = "authn.armada.io/kind";

pub const KIND_SESSION: &str = "session";
pub const KIND_KUBECONFIG: &str = "kubeconfig";

/// A server-issued session credential.
///
/// `name` never changes and `hashed_secret` is set exactly once at creation;
/// tokens are never re-keyed, only deleted and recreated. The single
/// exception is the in-place rehash of a legacy plaintext secret, which
/// preserves the secret value itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub name: String,
    pub hashed_secret: String,
    pub user_id: String,
    pub auth_provider: String,
    #[serde(default)]
    pub description: String,
    pub user_principal: Principal,
    #[serde(default)]
    pub group_principals: Vec<Principal>,
    /// Opaque provider session data, e.g. an OAuth access token.
    #[serde(default)]
    pub provider_info: HashMap<String, String>,
    /// 0 means the token never expires.
    pub ttl_millis: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_derived: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Token {
    /// Compute the stable expiry timestamp from the TTL and creation time.
    #[must_use]
    pub fn expiry_for(created_at: DateTime<Utc>, ttl_millis: i64) -> Option<DateTime<Utc>> {
        if ttl_millis == 0 {
            None
        } else {
            Some(created_at + Duration::milliseconds(ttl_millis))
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Split a wire token value `"<name>:<secret>"` on the first colon.
///
/// The secret itself may contain colons; the name never does.
#[must_use]
pub fn split_token_parts(token_auth_value: &str) -> Option<(&str, &str)> {
    let (name, secret) = token_auth_value.split_once(':')?;
    if name.is_empty() || secret.is_empty() {
        return None;
    }
    Some((name, secret))
}

/// Minimal caller token for provider-level tests.
#[cfg(test)]
pub(crate) fn caller_token_fixture() -> Token {
    let created_at = Utc::now();
    Token {
        name: "token-calr1".into(),
        hashed_secret: String::new(),
        user_id: "u-caller".into(),
        auth_provider: "local".into(),
        description: String::new(),
        user_principal: Principal::user("local", "u-caller", "Caller", "caller"),
        group_principals: Vec::new(),
        provider_info: HashMap::new(),
        ttl_millis: 0,
        created_at,
        expires_at: None,
        is_derived: false,
        labels: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;

    fn token_with_ttl(ttl_millis: i64) -> Token {
        let created_at = Utc::now();
        Token {
            name: "token-abc12".into(),
            hashed_secret: String::new(),
            user_id: "u-1".into(),
            auth_provider: "local".into(),
            description: String::new(),
            user_principal: Principal::user("local", "u-1", "User One", "uone"),
            group_principals: Vec::new(),
            provider_info: HashMap::new(),
            ttl_millis,
            created_at,
            expires_at: Token::expiry_for(created_at, ttl_millis),
            is_derived: false,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn zero_ttl_never_expires() {
        let token = token_with_ttl(0);
        assert!(token.expires_at.is_none());
        assert!(!token.is_expired_at(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn short_ttl_expires() {
        let token = token_with_ttl(1);
        assert!(token.is_expired_at(Utc::now() + Duration::seconds(1)));
    }

    #[test]
    fn split_on_first_colon_only() {
        let (name, secret) = split_token_parts("token-abc12:se:cr:et").unwrap();
        assert_eq!(name, "token-abc12");
        assert_eq!(secret, "se:cr:et");
    }

    #[test]
    fn split_rejects_missing_parts() {
        assert!(split_token_parts("nocolon").is_none());
        assert!(split_token_parts(":secret").is_none());
        assert!(split_token_parts("name:").is_none());
    }
}
