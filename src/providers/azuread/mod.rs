//! Azure Active Directory authentication via OAuth2 and Microsoft Graph.

pub mod graph;
pub mod migration;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use secrecy::ExposeSecret;

use crate::config::AzureAdConfig;
use crate::errors::{AuthError, Result};
use crate::principal::{append_deduplicated, Principal, PrincipalKind};
use crate::providers::{enforce_access, AuthenticatedPrincipal, Credential, PrincipalProvider};
use crate::tokens::Token;

use graph::{GraphApi, GraphClient, GraphGroup};

pub use migration::{migrate_endpoints, ConfigWriter};

pub const PROVIDER_NAME: &str = "azuread";

/// Key under which the Graph access token rides on tokens and in the
/// provider secret store.
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Exchanges an authorization code for a Graph access token.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<String>;
}

struct OauthExchanger {
    client: BasicClient,
}

#[async_trait]
impl CodeExchanger for OauthExchanger {
    async fn exchange(&self, code: &str) -> Result<String> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|err| match err {
                oauth2::RequestTokenError::ServerResponse(_) => {
                    AuthError::unauthorized_from(anyhow!("authorization code rejected"))
                }
                other => AuthError::server(anyhow!("token exchange failed: {other}")),
            })?;
        Ok(response.access_token().secret().clone())
    }
}

pub struct AzureAdProvider {
    config: AzureAdConfig,
    graph: Box<dyn GraphApi>,
    exchanger: Box<dyn CodeExchanger>,
    oauth: BasicClient,
    /// Group display names resolved through Graph, cleared on endpoint
    /// migration.
    group_cache: Mutex<HashMap<String, String>>,
}

impl AzureAdProvider {
    pub fn new(config: AzureAdConfig) -> Result<Self> {
        let oauth = oauth_client(&config)?;
        let graph = Box::new(GraphClient::new(&config.graph_endpoint));
        let exchanger = Box::new(OauthExchanger {
            client: oauth_client(&config)?,
        });
        Ok(Self::with_parts(config, graph, exchanger, oauth))
    }

    #[must_use]
    pub fn with_parts(
        config: AzureAdConfig,
        graph: Box<dyn GraphApi>,
        exchanger: Box<dyn CodeExchanger>,
        oauth: BasicClient,
    ) -> Self {
        Self {
            config,
            graph,
            exchanger,
            oauth,
            group_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Authorization URL the browser is sent to, with a random CSRF state.
    #[must_use]
    pub fn authorize_url(&self) -> (url::Url, CsrfToken) {
        self.oauth
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("openid".into()))
            .add_scope(Scope::new("profile".into()))
            .add_scope(Scope::new("https://graph.microsoft.com/.default".into()))
            .url()
    }

    pub fn clear_group_cache(&self) {
        if let Ok(mut cache) = self.group_cache.lock() {
            cache.clear();
        }
    }

    fn cache_groups(&self, groups: &[GraphGroup]) {
        if let Ok(mut cache) = self.group_cache.lock() {
            for group in groups {
                cache.insert(group.id.clone(), group.display_name.clone());
            }
        }
    }

    fn cached_group_name(&self, id: &str) -> Option<String> {
        self.group_cache.lock().ok()?.get(id).cloned()
    }

    fn access_token_of(caller: &Token) -> Result<&str> {
        caller
            .provider_info
            .get(ACCESS_TOKEN_KEY)
            .map(String::as_str)
            .ok_or_else(|| {
                AuthError::unauthorized_from(anyhow!("caller token carries no graph access token"))
            })
    }

    fn group_principals(&self, groups: &[GraphGroup]) -> Vec<Principal> {
        let mut principals = Vec::new();
        append_deduplicated(
            &mut principals,
            groups
                .iter()
                .map(|group| Principal::group(PROVIDER_NAME, &group.id, &group.display_name))
                .collect(),
        );
        principals
    }
}

fn oauth_client(config: &AzureAdConfig) -> Result<BasicClient> {
    let auth_url = AuthUrl::new(config.auth_endpoint.clone())
        .map_err(|err| AuthError::server(anyhow!("auth endpoint: {err}")))?;
    let token_url = TokenUrl::new(config.token_endpoint.clone())
        .map_err(|err| AuthError::server(anyhow!("token endpoint: {err}")))?;
    let redirect = RedirectUrl::new(config.redirect_uri.clone())
        .map_err(|err| AuthError::server(anyhow!("redirect uri: {err}")))?;
    Ok(BasicClient::new(
        ClientId::new(config.application_id.clone()),
        Some(ClientSecret::new(
            config.application_secret.expose_secret().to_string(),
        )),
        auth_url,
        Some(token_url),
    )
    .set_redirect_uri(redirect))
}

#[async_trait]
impl PrincipalProvider for AzureAdProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self, credential: Credential) -> Result<AuthenticatedPrincipal> {
        let Credential::OAuthCode { code } = credential else {
            return Err(AuthError::unauthorized());
        };
        let access_token = self.exchanger.exchange(&code).await?;

        let graph_user = self.graph.me(&access_token).await?;
        let graph_groups = self
            .graph
            .transitive_groups(&access_token, &graph_user.id)
            .await?;
        self.cache_groups(&graph_groups);

        let user = Principal::user(
            PROVIDER_NAME,
            &graph_user.id,
            &graph_user.display_name,
            &graph_user.user_principal_name,
        );
        let groups = self.group_principals(&graph_groups);
        enforce_access(
            self.config.access_mode,
            &self.config.allowed_principal_ids,
            &user,
            &groups,
        )?;

        Ok(AuthenticatedPrincipal {
            user,
            groups,
            provider_info: HashMap::from([(ACCESS_TOKEN_KEY.to_string(), access_token)]),
        })
    }

    async fn search_principals(
        &self,
        query: &str,
        kind: Option<PrincipalKind>,
        caller: &Token,
    ) -> Result<Vec<Principal>> {
        let access_token = Self::access_token_of(caller)?;
        let mut principals = Vec::new();
        if kind.is_none() || kind == Some(PrincipalKind::User) {
            for user in self.graph.search_users(access_token, query).await? {
                principals.push(Principal::user(
                    PROVIDER_NAME,
                    &user.id,
                    &user.display_name,
                    &user.user_principal_name,
                ));
            }
        }
        if kind.is_none() || kind == Some(PrincipalKind::Group) {
            let groups = self.graph.search_groups(access_token, query).await?;
            self.cache_groups(&groups);
            append_deduplicated(&mut principals, self.group_principals(&groups));
        }
        Ok(principals)
    }

    async fn get_principal(&self, id: &str, caller: &Token) -> Result<Principal> {
        let (provider, kind, external_id) = Principal::parse_id(id)?;
        if provider != PROVIDER_NAME {
            return Err(AuthError::InvalidFormat(format!("principal id {id:?}")));
        }
        match kind {
            PrincipalKind::User => {
                let access_token = Self::access_token_of(caller)?;
                let user = self.graph.user(access_token, &external_id).await?;
                Ok(Principal::user(
                    PROVIDER_NAME,
                    &user.id,
                    &user.display_name,
                    &user.user_principal_name,
                ))
            }
            PrincipalKind::Group => {
                if let Some(name) = self.cached_group_name(&external_id) {
                    return Ok(Principal::group(PROVIDER_NAME, &external_id, &name));
                }
                let access_token = Self::access_token_of(caller)?;
                let group = self.graph.group(access_token, &external_id).await?;
                self.cache_groups(std::slice::from_ref(&group));
                Ok(Principal::group(
                    PROVIDER_NAME,
                    &group.id,
                    &group.display_name,
                ))
            }
        }
    }
}
