//! Token lifecycle: create, verify, list, derive, and delete.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::TtlPolicy;
use crate::errors::{AuthError, Result};
use crate::hash;
use crate::principal::Principal;
use crate::store::{ProviderSecretStore, StoreError, TokenStore};
use crate::tokens::{
    split_token_parts, Token, KIND_KUBECONFIG, KIND_SESSION, TOKEN_KIND_LABEL, USER_ID_LABEL,
};

/// Providers whose login carries an OAuth access token that must be cached
/// in the per-user provider secret.
const OAUTH_TOKEN_PROVIDERS: &[&str] = &["azuread"];

const NAME_RETRIES: u32 = 3;
const KUBECONFIG_CREATE_RETRIES: u32 = 5;

pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    secrets: Arc<dyn ProviderSecretStore>,
    ttl_policy: TtlPolicy,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        secrets: Arc<dyn ProviderSecretStore>,
        ttl_policy: TtlPolicy,
    ) -> Self {
        Self {
            store,
            secrets,
            ttl_policy,
        }
    }

    /// Clamp a requested TTL (milliseconds) to the configured maximum.
    ///
    /// `requested <= 0` asks for "no expiry" and receives the max when one
    /// is configured; negative values never mint a born-expired token.
    /// `max == 0` means no cap at all.
    #[must_use]
    pub fn clamp_to_max_ttl(&self, requested_millis: i64) -> i64 {
        let max_millis = self.ttl_policy.max_ttl_minutes * 60_000;
        if max_millis == 0 {
            return requested_millis.max(0);
        }
        if requested_millis <= 0 || requested_millis > max_millis {
            return max_millis;
        }
        requested_millis
    }

    /// Create a login token for an authenticated principal.
    ///
    /// Returns the stored token plus the raw secret; the raw value exists
    /// only to be handed to the client as `"<name>:<secret>"`.
    pub async fn create_login_token(
        &self,
        user_id: &str,
        user_principal: Principal,
        group_principals: Vec<Principal>,
        provider_token: &str,
        ttl_millis: i64,
        description: &str,
    ) -> Result<(Token, String)> {
        let provider = user_principal.provider.clone();
        if OAUTH_TOKEN_PROVIDERS.contains(&provider.as_str()) && !provider_token.is_empty() {
            self.secrets
                .upsert(user_id, &provider, provider_token)
                .await
                .map_err(AuthError::server)?;
        }

        let token = self.blank_token(
            user_id,
            user_principal,
            group_principals,
            ttl_millis,
            description,
            false,
            KIND_SESSION,
        );
        self.create_with_fresh_name(token).await
    }

    /// Mint a short-lived token carrying the same identity as an already
    /// valid token. TTL is clamped to the platform maximum.
    pub async fn create_derived_token(
        &self,
        existing_raw_token: &str,
        description: &str,
        ttl_override_millis: i64,
    ) -> Result<(Token, String)> {
        let source = self.verify_and_fetch(existing_raw_token).await?;
        let ttl_millis = self.clamp_to_max_ttl(ttl_override_millis);

        let mut token = self.blank_token(
            &source.user_id,
            source.user_principal.clone(),
            source.group_principals.clone(),
            ttl_millis,
            description,
            true,
            KIND_SESSION,
        );
        token.auth_provider = source.auth_provider.clone();
        token.provider_info = source.provider_info.clone();
        self.create_with_fresh_name(token).await
    }

    /// Resolve and verify a wire token value `"<name>:<secret>"`.
    ///
    /// Unknown names and wrong secrets both pay the hash-verification cost
    /// so the two paths are not trivially separable by timing.
    pub async fn verify_and_fetch(&self, raw_token_value: &str) -> Result<Token> {
        let (name, secret) = split_token_parts(raw_token_value)
            .ok_or_else(|| AuthError::InvalidFormat("token value".into()))?;

        let stored = match self.store.get(name).await {
            Ok(token) => token,
            Err(StoreError::NotFound(_)) => {
                hash::dummy_verify(secret);
                return Err(AuthError::NotFound("token".into()));
            }
            Err(err) => return Err(AuthError::server(err)),
        };

        let was_legacy = hash::is_legacy_plaintext(&stored.hashed_secret);
        hash::verify_secret(&stored.hashed_secret, secret)?;

        if stored.is_expired() {
            return Err(AuthError::Expired);
        }

        if was_legacy {
            // Upgrade the stored secret in place; name and session survive.
            let mut upgraded = stored.clone();
            upgraded.hashed_secret = hash::hash_secret(secret)?;
            match self.store.update(upgraded.clone()).await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    // The presented secret already verified; serve the login
                    // and retry the rehash on the next request.
                    warn!("failed to rehash legacy token {name}: {err}");
                }
            }
        }

        Ok(stored)
    }

    /// Delete a token by name. Deleting an already-absent token succeeds.
    pub async fn delete_by_name(&self, name: &str) -> Result<()> {
        match self.store.delete(name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(AuthError::server(err)),
        }
    }

    /// List every token owned by `user_id`, including expired ones.
    pub async fn list_tokens(&self, user_id: &str) -> Result<Vec<Token>> {
        self.store
            .list_by_label(&[(USER_ID_LABEL, user_id)])
            .await
            .map_err(AuthError::server)
    }

    /// Persist an updated token, e.g. refreshed provider info.
    pub async fn update_token(&self, token: Token) -> Result<Token> {
        self.store.update(token).await.map_err(AuthError::server)
    }

    /// Fetch the cached provider secret for a user, falling back to the
    /// access token carried in any of the given tokens.
    pub async fn get_provider_secret(
        &self,
        user_id: &str,
        provider: &str,
        fallback_tokens: &[Token],
    ) -> Result<Option<String>> {
        if let Some(secret) = self
            .secrets
            .get(user_id, provider)
            .await
            .map_err(AuthError::server)?
        {
            return Ok(Some(secret));
        }
        Ok(fallback_tokens
            .iter()
            .find_map(|token| token.provider_info.get("access_token").cloned())
            .filter(|secret| !secret.is_empty()))
    }

    /// Create a kubeconfig token under a caller-chosen name.
    ///
    /// The name may collide with a previous token whose delete is still in
    /// flight; creation is retried under exponential backoff until the
    /// delete lands.
    pub async fn issue_kubeconfig_token(
        &self,
        cluster_name: &str,
        token_name: &str,
        user_name: &str,
        principal: Principal,
    ) -> Result<(Token, String)> {
        let ttl_millis =
            self.clamp_to_max_ttl(self.ttl_policy.kubeconfig_default_ttl_minutes * 60_000);

        for attempt in 1..=KUBECONFIG_CREATE_RETRIES {
            if attempt > 1 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 2));
                debug!("kubeconfig token {token_name} exists, backing off {backoff:?}");
                sleep(backoff).await;
            }

            let mut token = self.blank_token(
                user_name,
                principal.clone(),
                Vec::new(),
                ttl_millis,
                &format!("Kubeconfig token for cluster {cluster_name}"),
                true,
                KIND_KUBECONFIG,
            );
            token.name = token_name.to_string();
            let secret = generate_secret()?;
            token.hashed_secret = hash::hash_secret(&secret)?;

            match self.store.create(token).await {
                Ok(created) => return Ok((created, secret)),
                Err(StoreError::AlreadyExists(_)) => continue,
                Err(err) => return Err(AuthError::server(err)),
            }
        }

        error!("kubeconfig token {token_name} still exists after retries");
        Err(AuthError::server(anyhow::anyhow!(
            "token name still in use after {KUBECONFIG_CREATE_RETRIES} attempts"
        )))
    }

    /// Default session TTL in milliseconds, clamped to the platform max.
    #[must_use]
    pub fn session_ttl_millis(&self) -> i64 {
        self.clamp_to_max_ttl(self.ttl_policy.session_ttl_minutes * 60_000)
    }

    pub(crate) fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    #[allow(clippy::too_many_arguments)]
    fn blank_token(
        &self,
        user_id: &str,
        user_principal: Principal,
        group_principals: Vec<Principal>,
        ttl_millis: i64,
        description: &str,
        is_derived: bool,
        kind: &str,
    ) -> Token {
        let created_at = Utc::now();
        let provider = user_principal.provider.clone();
        Token {
            name: String::new(),
            hashed_secret: String::new(),
            user_id: user_id.to_string(),
            auth_provider: provider,
            description: description.to_string(),
            user_principal,
            group_principals,
            provider_info: HashMap::new(),
            ttl_millis,
            created_at,
            expires_at: Token::expiry_for(created_at, ttl_millis),
            is_derived,
            labels: HashMap::from([
                (USER_ID_LABEL.to_string(), user_id.to_string()),
                (TOKEN_KIND_LABEL.to_string(), kind.to_string()),
            ]),
        }
    }

    /// Assign a generated name and secret, then store. A name collision is
    /// astronomically unlikely but cheap to retry.
    async fn create_with_fresh_name(&self, template: Token) -> Result<(Token, String)> {
        for _ in 0..NAME_RETRIES {
            let mut token = template.clone();
            token.name = generate_token_name();
            let secret = generate_secret()?;
            token.hashed_secret = hash::hash_secret(&secret)?;
            match self.store.create(token).await {
                Ok(created) => return Ok((created, secret)),
                Err(StoreError::AlreadyExists(name)) => {
                    warn!("token name collision on {name}, regenerating");
                    continue;
                }
                Err(err) => return Err(AuthError::server(err)),
            }
        }
        Err(AuthError::server(anyhow::anyhow!(
            "could not allocate a unique token name"
        )))
    }
}

/// Generate a raw token secret: 32 bytes of OS entropy, URL-safe base64.
pub(crate) fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::server(anyhow::anyhow!("secret generation failed: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a token name `token-<5 random lowercase alphanumerics>`.
fn generate_token_name() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("token-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryProviderSecretStore, MemoryTokenStore};

    fn manager(max_ttl_minutes: i64) -> TokenManager {
        TokenManager::new(
            MemoryTokenStore::new(),
            MemoryProviderSecretStore::new(),
            TtlPolicy {
                max_ttl_minutes,
                kubeconfig_default_ttl_minutes: 960,
                session_ttl_minutes: 960,
            },
        )
    }

    fn alice() -> Principal {
        Principal::user("local", "u-alice", "Alice", "alice")
    }

    #[test]
    fn clamp_follows_policy_table() {
        let capped = manager(60); // max = 3_600_000 ms
        assert_eq!(capped.clamp_to_max_ttl(0), 3_600_000);
        assert_eq!(capped.clamp_to_max_ttl(1_000), 1_000);
        assert_eq!(capped.clamp_to_max_ttl(3_600_000), 3_600_000);
        assert_eq!(capped.clamp_to_max_ttl(7_200_000), 3_600_000);
        // A negative override must never produce a born-expired token.
        assert_eq!(capped.clamp_to_max_ttl(-1_000), 3_600_000);

        let uncapped = manager(0);
        assert_eq!(uncapped.clamp_to_max_ttl(0), 0);
        assert_eq!(uncapped.clamp_to_max_ttl(-1_000), 0);
        assert_eq!(uncapped.clamp_to_max_ttl(7_200_000), 7_200_000);
    }

    #[tokio::test]
    async fn login_token_round_trip() {
        let mgr = manager(0);
        let (token, secret) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 0, "ui session")
            .await
            .unwrap();
        assert!(token.name.starts_with("token-"));
        assert!(token.hashed_secret.starts_with("$1:"));
        assert!(token.expires_at.is_none());

        let fetched = mgr
            .verify_and_fetch(&format!("{}:{}", token.name, secret))
            .await
            .unwrap();
        assert_eq!(fetched.user_id, "u-alice");
    }

    #[tokio::test]
    async fn wrong_secret_is_mismatch_unknown_name_is_not_found() {
        let mgr = manager(0);
        let (token, _secret) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 0, "")
            .await
            .unwrap();

        let err = mgr
            .verify_and_fetch(&format!("{}:wrong", token.name))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SecretMismatch));

        let err = mgr.verify_and_fetch("token-zzzzz:wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let mgr = manager(0);
        let (token, secret) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 1, "")
            .await
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        let err = mgr
            .verify_and_fetch(&format!("{}:{}", token.name, secret))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn legacy_plaintext_token_rehashed_in_place() {
        let mgr = manager(0);
        let (token, secret) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 0, "")
            .await
            .unwrap();

        // Simulate a token stored before hashing was enabled.
        let mut legacy = token.clone();
        legacy.hashed_secret = secret.clone();
        mgr.store().update(legacy).await.unwrap();

        let fetched = mgr
            .verify_and_fetch(&format!("{}:{}", token.name, secret))
            .await
            .unwrap();
        assert_eq!(fetched.name, token.name);
        assert!(fetched.hashed_secret.starts_with("$1:"));

        // The live session keeps working after the upgrade.
        mgr.verify_and_fetch(&format!("{}:{}", token.name, secret))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn derived_token_copies_identity_and_clamps_ttl() {
        let mgr = manager(60);
        let (login, secret) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 60_000, "")
            .await
            .unwrap();

        let (derived, derived_secret) = mgr
            .create_derived_token(&format!("{}:{}", login.name, secret), "cli", 999_999_999)
            .await
            .unwrap();
        assert!(derived.is_derived);
        assert_eq!(derived.user_id, "u-alice");
        assert_eq!(derived.auth_provider, "local");
        assert_eq!(derived.ttl_millis, 3_600_000);
        assert_ne!(derived.name, login.name);

        mgr.verify_and_fetch(&format!("{}:{}", derived.name, derived_secret))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn derived_token_requires_valid_source() {
        let mgr = manager(0);
        let err = mgr
            .create_derived_token("token-nope:secret", "cli", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let mgr = manager(0);
        let (token, _) = mgr
            .create_login_token("u-alice", alice(), Vec::new(), "", 0, "")
            .await
            .unwrap();
        mgr.delete_by_name(&token.name).await.unwrap();
        mgr.delete_by_name(&token.name).await.unwrap();
    }

    #[tokio::test]
    async fn list_tokens_by_user() {
        let mgr = manager(0);
        mgr.create_login_token("u-alice", alice(), Vec::new(), "", 0, "")
            .await
            .unwrap();
        mgr.create_login_token("u-alice", alice(), Vec::new(), "", 0, "")
            .await
            .unwrap();
        mgr.create_login_token(
            "u-bob",
            Principal::user("local", "u-bob", "Bob", "bob"),
            Vec::new(),
            "",
            0,
            "",
        )
        .await
        .unwrap();
        assert_eq!(mgr.list_tokens("u-alice").await.unwrap().len(), 2);
        assert_eq!(mgr.list_tokens("u-bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oauth_provider_token_cached_and_refreshed() {
        let store = MemoryTokenStore::new();
        let secrets = MemoryProviderSecretStore::new();
        let mgr = TokenManager::new(store, secrets.clone(), TtlPolicy::default());
        let azure_user = Principal::user("azuread", "oid-1", "Alice", "alice@example.com");

        mgr.create_login_token("u-alice", azure_user.clone(), Vec::new(), "tok-1", 0, "")
            .await
            .unwrap();
        assert_eq!(
            secrets.get("u-alice", "azuread").await.unwrap().as_deref(),
            Some("tok-1")
        );

        mgr.create_login_token("u-alice", azure_user, Vec::new(), "tok-2", 0, "")
            .await
            .unwrap();
        assert_eq!(
            secrets.get("u-alice", "azuread").await.unwrap().as_deref(),
            Some("tok-2")
        );
    }

    #[tokio::test]
    async fn kubeconfig_token_retries_past_delete_in_flight() {
        let mgr = manager(60);
        let (existing, _) = mgr
            .issue_kubeconfig_token("c-prod", "kubeconfig-u-alice", "u-alice", alice())
            .await
            .unwrap();
        assert_eq!(existing.ttl_millis, 3_600_000); // clamped from 960m default

        // Delete lands while the second issue is backing off.
        let mgr = Arc::new(mgr);
        let issuer = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.issue_kubeconfig_token("c-prod", "kubeconfig-u-alice", "u-alice", alice())
                    .await
            })
        };
        sleep(Duration::from_millis(50)).await;
        mgr.delete_by_name("kubeconfig-u-alice").await.unwrap();
        let (reissued, _) = issuer.await.unwrap().unwrap();
        assert_eq!(reissued.name, "kubeconfig-u-alice");
    }
}
