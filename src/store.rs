//! Persistence ports for tokens and per-user provider secrets.
//!
//! The platform persists tokens as custom resources behind these traits;
//! the core only assumes read-your-writes consistency and atomic
//! create-if-absent. The in-memory implementations back the test suite and
//! single-process embedders.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::tokens::Token;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Create-if-absent collided with an existing object. Distinguishable
    /// so callers can retry with a new name instead of overwriting.
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error("object {0} not found")]
    NotFound(String),
    #[error("store failure")]
    Internal(#[source] anyhow::Error),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Atomic create-if-absent keyed by `token.name`.
    async fn create(&self, token: Token) -> Result<Token, StoreError>;
    async fn get(&self, name: &str) -> Result<Token, StoreError>;
    async fn update(&self, token: Token) -> Result<Token, StoreError>;
    /// Deleting an absent object is `NotFound`; idempotency is layered on
    /// by the token manager.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// All tokens whose labels contain every `(key, value)` in `selector`.
    /// An empty selector lists everything.
    async fn list_by_label(&self, selector: &[(&str, &str)]) -> Result<Vec<Token>, StoreError>;
}

/// Per-user secret holding provider access tokens, at most one entry per
/// provider per user, overwritten on refresh.
#[async_trait]
pub trait ProviderSecretStore: Send + Sync {
    async fn upsert(&self, user_id: &str, provider: &str, secret: &str) -> Result<(), StoreError>;
    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<String>, StoreError>;
    async fn remove(&self, user_id: &str, provider: &str) -> Result<(), StoreError>;
    /// Remove the secret for `provider` across all users. Used by the
    /// AzureAD endpoint migration to drop tokens minted for old endpoints.
    async fn remove_all_for_provider(&self, provider: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, Token>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn create(&self, token: Token) -> Result<Token, StoreError> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(&token.name) {
            return Err(StoreError::AlreadyExists(token.name));
        }
        tokens.insert(token.name.clone(), token.clone());
        Ok(token)
    }

    async fn get(&self, name: &str) -> Result<Token, StoreError> {
        let tokens = self.tokens.lock().await;
        tokens
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, token: Token) -> Result<Token, StoreError> {
        let mut tokens = self.tokens.lock().await;
        if !tokens.contains_key(&token.name) {
            return Err(StoreError::NotFound(token.name));
        }
        tokens.insert(token.name.clone(), token.clone());
        Ok(token)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().await;
        tokens
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list_by_label(&self, selector: &[(&str, &str)]) -> Result<Vec<Token>, StoreError> {
        let tokens = self.tokens.lock().await;
        Ok(tokens
            .values()
            .filter(|token| {
                selector
                    .iter()
                    .all(|(key, value)| token.labels.get(*key).is_some_and(|v| v == value))
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryProviderSecretStore {
    secrets: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryProviderSecretStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ProviderSecretStore for MemoryProviderSecretStore {
    async fn upsert(&self, user_id: &str, provider: &str, secret: &str) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock().await;
        secrets
            .entry(user_id.to_string())
            .or_default()
            .insert(provider.to_string(), secret.to_string());
        Ok(())
    }

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<String>, StoreError> {
        let secrets = self.secrets.lock().await;
        Ok(secrets
            .get(user_id)
            .and_then(|per_provider| per_provider.get(provider))
            .cloned())
    }

    async fn remove(&self, user_id: &str, provider: &str) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock().await;
        if let Some(per_provider) = secrets.get_mut(user_id) {
            per_provider.remove(provider);
        }
        Ok(())
    }

    async fn remove_all_for_provider(&self, provider: &str) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock().await;
        for per_provider in secrets.values_mut() {
            per_provider.remove(provider);
        }
        Ok(())
    }
}
