//! One-time rewrite of deprecated Azure AD endpoints.
//!
//! Configs created against the retired `login.windows.net` /
//! `graph.windows.net` endpoints are rewritten to their modern
//! equivalents. The rewrite stamps a marker annotation so it never runs
//! twice, and drops every cached access token minted for the old
//! endpoints along with any in-memory group cache.

use async_trait::async_trait;
use tracing::info;

use crate::config::{AzureAdConfig, AZUREAD_MIGRATED_ANNOTATION};
use crate::errors::{AuthError, Result};
use crate::store::ProviderSecretStore;

use super::PROVIDER_NAME;

const DEPRECATED_LOGIN_HOST: &str = "login.windows.net";
const MODERN_LOGIN_HOST: &str = "login.microsoftonline.com";
const DEPRECATED_GRAPH_HOST: &str = "graph.windows.net";
const MODERN_GRAPH_ENDPOINT: &str = "https://graph.microsoft.com";

/// Persists an updated provider config.
#[async_trait]
pub trait ConfigWriter: Send + Sync {
    async fn save_azuread(&self, config: &AzureAdConfig) -> Result<()>;
}

/// Rewrite deprecated endpoints in place and persist the result.
///
/// Returns `true` when a migration actually ran. Calling it on an
/// already-migrated config is a no-op.
pub async fn migrate_endpoints(
    config: &mut AzureAdConfig,
    secrets: &dyn ProviderSecretStore,
    writer: &dyn ConfigWriter,
) -> Result<bool> {
    if config.is_endpoint_migrated() {
        return Ok(false);
    }

    config.auth_endpoint = config
        .auth_endpoint
        .replace(DEPRECATED_LOGIN_HOST, MODERN_LOGIN_HOST);
    config.token_endpoint = config
        .token_endpoint
        .replace(DEPRECATED_LOGIN_HOST, MODERN_LOGIN_HOST);
    if config.graph_endpoint.contains(DEPRECATED_GRAPH_HOST) {
        config.graph_endpoint = MODERN_GRAPH_ENDPOINT.to_string();
    }

    // Access tokens minted for the old endpoints are useless against the
    // new ones.
    secrets
        .remove_all_for_provider(PROVIDER_NAME)
        .await
        .map_err(AuthError::server)?;

    config
        .annotations
        .insert(AZUREAD_MIGRATED_ANNOTATION.to_string(), "true".to_string());
    writer.save_azuread(config).await?;
    info!("migrated azuread config to modern endpoints");
    Ok(true)
}
