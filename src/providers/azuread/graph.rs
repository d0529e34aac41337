//! Microsoft Graph client.

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::errors::{AuthError, Result};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub user_principal_name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphGroup {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Deserialize)]
struct Page<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// The Graph operations the provider consumes.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn me(&self, access_token: &str) -> Result<GraphUser>;
    async fn user(&self, access_token: &str, id: &str) -> Result<GraphUser>;
    async fn group(&self, access_token: &str, id: &str) -> Result<GraphGroup>;
    /// Transitive (nested) group memberships of a user.
    async fn transitive_groups(&self, access_token: &str, user_id: &str)
        -> Result<Vec<GraphGroup>>;
    async fn search_users(&self, access_token: &str, query: &str) -> Result<Vec<GraphUser>>;
    async fn search_groups(&self, access_token: &str, query: &str) -> Result<Vec<GraphGroup>>;
}

pub struct GraphClient {
    http: reqwest::Client,
    endpoint: String,
}

impl GraphClient {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1.0{path}", self.endpoint)
    }

    async fn get_json<T: DeserializeOwned>(&self, access_token: &str, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| AuthError::server(anyhow!(err).context("graph request")))?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(AuthError::unauthorized()),
            StatusCode::NOT_FOUND => Err(AuthError::NotFound("graph object".into())),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| AuthError::server(anyhow!(err).context("graph response body"))),
            status => Err(AuthError::server(anyhow!(
                "graph request failed with status {status}"
            ))),
        }
    }

    /// Follow `@odata.nextLink` pagination until exhausted.
    async fn get_all<T: DeserializeOwned>(
        &self,
        access_token: &str,
        first_url: String,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let page: Page<T> = self.get_json(access_token, &url).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn me(&self, access_token: &str) -> Result<GraphUser> {
        self.get_json(access_token, &self.url("/me")).await
    }

    async fn user(&self, access_token: &str, id: &str) -> Result<GraphUser> {
        self.get_json(access_token, &self.url(&format!("/users/{id}")))
            .await
    }

    async fn group(&self, access_token: &str, id: &str) -> Result<GraphGroup> {
        self.get_json(access_token, &self.url(&format!("/groups/{id}")))
            .await
    }

    async fn transitive_groups(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Vec<GraphGroup>> {
        let url = self.url(&format!(
            "/users/{user_id}/transitiveMemberOf/microsoft.graph.group?$select=id,displayName"
        ));
        self.get_all(access_token, url).await
    }

    async fn search_users(&self, access_token: &str, query: &str) -> Result<Vec<GraphUser>> {
        let filter = format!(
            "startswith(displayName,'{0}') or startswith(userPrincipalName,'{0}')",
            escape_odata(query)
        );
        let url = self.url(&format!("/users?$filter={}", urlencode(&filter)));
        self.get_all(access_token, url).await
    }

    async fn search_groups(&self, access_token: &str, query: &str) -> Result<Vec<GraphGroup>> {
        let filter = format!("startswith(displayName,'{}')", escape_odata(query));
        let url = self.url(&format!("/groups?$filter={}", urlencode(&filter)));
        self.get_all(access_token, url).await
    }
}

/// Single quotes double in OData string literals.
fn escape_odata(value: &str) -> String {
    value.replace('\'', "''")
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
