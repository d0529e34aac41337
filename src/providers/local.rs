//! Local password provider: verifies against stored password hashes with
//! no network involvement.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use secrecy::ExposeSecret;

use super::{enforce_access, AuthenticatedPrincipal, Credential, PrincipalProvider};
use crate::config::LocalConfig;
use crate::errors::{AuthError, Result};
use crate::principal::{append_deduplicated, Principal, PrincipalKind};
use crate::tokens::Token;

pub const PROVIDER_NAME: &str = "local";

/// A locally managed account.
#[derive(Clone, Debug)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    /// PHC-format password hash.
    pub password_hash: String,
    pub enabled: bool,
    /// External ids of the groups this user belongs to.
    pub groups: Vec<String>,
}

/// Read-only view of the platform's local user and group records.
#[async_trait]
pub trait LocalUserDatabase: Send + Sync {
    async fn user_by_username(&self, username: &str) -> Result<Option<LocalUser>>;
    async fn user_by_id(&self, id: &str) -> Result<Option<LocalUser>>;
    async fn group_display_name(&self, group_id: &str) -> Result<Option<String>>;
    async fn search_users(&self, query: &str) -> Result<Vec<LocalUser>>;
    async fn search_groups(&self, query: &str) -> Result<Vec<(String, String)>>;
}

pub struct LocalProvider {
    config: LocalConfig,
    users: Box<dyn LocalUserDatabase>,
}

impl LocalProvider {
    pub fn new(config: LocalConfig, users: Box<dyn LocalUserDatabase>) -> Self {
        Self { config, users }
    }

    async fn principals_for(&self, user: &LocalUser) -> Result<(Principal, Vec<Principal>)> {
        let user_principal =
            Principal::user(PROVIDER_NAME, &user.id, &user.display_name, &user.username);
        let mut groups = Vec::new();
        for group_id in &user.groups {
            let display_name = self
                .users
                .group_display_name(group_id)
                .await?
                .unwrap_or_else(|| group_id.clone());
            append_deduplicated(
                &mut groups,
                vec![Principal::group(PROVIDER_NAME, group_id, &display_name)],
            );
        }
        Ok((user_principal, groups))
    }
}

#[async_trait]
impl PrincipalProvider for LocalProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal> {
        let Credential::Basic { username, password } = credential else {
            return Err(AuthError::unauthorized());
        };
        if password.expose_secret().is_empty() {
            return Err(AuthError::unauthorized());
        }

        let Some(user) = self.users.user_by_username(&username).await? else {
            // Burn a verification against a fixed hash so unknown users
            // cost the same as wrong passwords.
            let _ = verify_password("no-such-user", DUMMY_HASH);
            return Err(AuthError::unauthorized());
        };

        verify_password(password.expose_secret(), &user.password_hash)?;

        if !user.enabled {
            return Err(AuthError::PermissionDenied);
        }

        let (user_principal, groups) = self.principals_for(&user).await?;
        enforce_access(
            self.config.access_mode,
            &self.config.allowed_principal_ids,
            &user_principal,
            &groups,
        )?;

        Ok(AuthenticatedPrincipal {
            user: user_principal,
            groups,
            provider_info: Default::default(),
        })
    }

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        _caller: &Token,
    ) -> Result<Vec<Principal>> {
        let mut principals = Vec::new();
        if kind.is_none() || kind == Some(PrincipalKind::User) {
            for user in self.users.search_users(query).await? {
                principals.push(Principal::user(
                    PROVIDER_NAME,
                    &user.id,
                    &user.display_name,
                    &user.username,
                ));
            }
        }
        if kind.is_none() || kind == Some(PrincipalKind::Group) {
            let mut groups = Vec::new();
            for (id, display_name) in self.users.search_groups(query).await? {
                groups.push(Principal::group(PROVIDER_NAME, &id, &display_name));
            }
            append_deduplicated(&mut principals, groups);
        }
        Ok(principals)
    }

    async fn get_principal(&self, id: &str, _caller: &Token) -> Result<Principal> {
        let (provider, kind, external_id) = Principal::parse_id(id)?;
        if provider != PROVIDER_NAME {
            return Err(AuthError::InvalidFormat(format!("principal id {id:?}")));
        }
        match kind {
            PrincipalKind::User => {
                let user = self
                    .users
                    .user_by_id(&external_id)
                    .await?
                    .ok_or_else(|| AuthError::NotFound("principal".into()))?;
                Ok(Principal::user(
                    PROVIDER_NAME,
                    &user.id,
                    &user.display_name,
                    &user.username,
                ))
            }
            PrincipalKind::Group => {
                let display_name = self
                    .users
                    .group_display_name(&external_id)
                    .await?
                    .ok_or_else(|| AuthError::NotFound("principal".into()))?;
                Ok(Principal::group(PROVIDER_NAME, &external_id, &display_name))
            }
        }
    }
}

/// PHC hash of an unguessable value, used to equalize the unknown-user path.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$MTIzNDU2Nzg5MDEyMzQ1Ng$dGVzdGhhc2h0ZXN0aGFzaHRlc3RoYXNodGVzdGhhc2g";

fn verify_password(candidate: &str, stored_hash: &str) -> Result<()> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|_| AuthError::InvalidFormat("password hash".into()))?;
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .map_err(|_| AuthError::unauthorized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessMode;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::SaltString;
    use argon2::PasswordHasher;
    use secrecy::SecretString;
    use std::collections::HashMap;

    struct FixedUsers {
        users: HashMap<String, LocalUser>,
        groups: HashMap<String, String>,
    }

    #[async_trait]
    impl LocalUserDatabase for FixedUsers {
        async fn user_by_username(&self, username: &str) -> Result<Option<LocalUser>> {
            Ok(self
                .users
                .values()
                .find(|u| u.username == username)
                .cloned())
        }

        async fn user_by_id(&self, id: &str) -> Result<Option<LocalUser>> {
            Ok(self.users.get(id).cloned())
        }

        async fn group_display_name(&self, group_id: &str) -> Result<Option<String>> {
            Ok(self.groups.get(group_id).cloned())
        }

        async fn search_users(&self, query: &str) -> Result<Vec<LocalUser>> {
            Ok(self
                .users
                .values()
                .filter(|u| u.username.contains(query))
                .cloned()
                .collect())
        }

        async fn search_groups(&self, query: &str) -> Result<Vec<(String, String)>> {
            Ok(self
                .groups
                .iter()
                .filter(|(_, name)| name.contains(query))
                .map(|(id, name)| (id.clone(), name.clone()))
                .collect())
        }
    }

    fn hash_password(password: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn provider(access_mode: AccessMode, allowed: Vec<String>) -> LocalProvider {
        let users = HashMap::from([(
            "u-alice".to_string(),
            LocalUser {
                id: "u-alice".into(),
                username: "alice".into(),
                display_name: "Alice".into(),
                password_hash: hash_password("secret1"),
                enabled: true,
                groups: vec!["g-admins".into()],
            },
        )]);
        let groups = HashMap::from([("g-admins".to_string(), "Administrators".to_string())]);
        LocalProvider::new(
            LocalConfig {
                access_mode,
                allowed_principal_ids: allowed,
            },
            Box::new(FixedUsers { users, groups }),
        )
    }

    fn basic(username: &str, password: &str) -> Credential {
        Credential::Basic {
            username: username.into(),
            password: SecretString::from(password.to_string()),
        }
    }

    #[tokio::test]
    async fn correct_password_yields_principals() {
        let provider = provider(AccessMode::Unrestricted, Vec::new());
        let authed = provider
            .authenticate(basic("alice", "secret1"))
            .await
            .unwrap();
        assert_eq!(authed.user.id, "local_user://u-alice");
        assert_eq!(authed.groups.len(), 1);
        assert_eq!(authed.groups[0].id, "local_group://g-admins");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_unauthorized() {
        let provider = provider(AccessMode::Unrestricted, Vec::new());
        assert!(matches!(
            provider.authenticate(basic("alice", "nope")).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            provider.authenticate(basic("mallory", "nope")).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn allow_list_enforced() {
        let provider = provider(
            AccessMode::Required,
            vec!["local_group://g-admins".to_string()],
        );
        provider
            .authenticate(basic("alice", "secret1"))
            .await
            .unwrap();

        let provider = provider_denied();
        assert!(matches!(
            provider.authenticate(basic("alice", "secret1")).await,
            Err(AuthError::PermissionDenied)
        ));
    }

    fn provider_denied() -> LocalProvider {
        provider(
            AccessMode::Required,
            vec!["local_user://u-someone-else".to_string()],
        )
    }
}
