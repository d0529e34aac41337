//! SP-facing HTTP endpoints: metadata, login initiation, and the
//! assertion consumer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tracing::error;

use crate::errors::AuthError;
use crate::tokens::manager::TokenManager;
use crate::tokens::request::session_cookie;

use super::SamlProvider;

#[derive(Clone)]
pub struct SamlState {
    providers: Arc<HashMap<String, Arc<SamlProvider>>>,
    manager: Arc<TokenManager>,
    secure_cookies: bool,
}

impl SamlState {
    #[must_use]
    pub fn new(
        providers: HashMap<String, Arc<SamlProvider>>,
        manager: Arc<TokenManager>,
        secure_cookies: bool,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            manager,
            secure_cookies,
        }
    }

    fn provider(&self, name: &str) -> Result<&Arc<SamlProvider>, Response> {
        self.providers
            .get(name)
            .ok_or_else(|| (StatusCode::NOT_FOUND, "unknown provider").into_response())
    }
}

#[must_use]
pub fn router(state: SamlState) -> Router {
    Router::new()
        .route("/:provider/saml/metadata", get(metadata))
        .route("/:provider/login", get(login))
        .route("/:provider/saml/acs", post(acs))
        .with_state(state)
}

/// Generic response for an auth failure; detail stays in the logs.
fn error_response(err: &AuthError) -> Response {
    error!("saml endpoint error: {err:#}");
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, "authentication failed").into_response()
}

async fn metadata(Path(provider): Path<String>, State(state): State<SamlState>) -> Response {
    let provider = match state.provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    match provider.metadata_xml().await {
        Ok(xml) => ([(CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn login(Path(provider): Path<String>, State(state): State<SamlState>) -> Response {
    let provider = match state.provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    match provider.begin_login().await {
        Ok(redirect) => (
            StatusCode::FOUND,
            [
                (LOCATION, redirect.idp_redirect_url),
                (SET_COOKIE, redirect.relay_cookie),
            ],
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: String,
}

async fn acs(
    Path(provider): Path<String>,
    State(state): State<SamlState>,
    Form(form): Form<AcsForm>,
) -> Response {
    let provider = match state.provider(&provider) {
        Ok(provider) => Arc::clone(provider),
        Err(response) => return response,
    };
    let (authenticated, final_redirect) = match provider
        .handle_assertion(&form.saml_response, &form.relay_state)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(&err),
    };

    let user_id = authenticated.user.id.clone();
    let created = state
        .manager
        .create_login_token(
            &user_id,
            authenticated.user,
            authenticated.groups,
            "",
            state.manager.session_ttl_millis(),
            "SAML login session",
        )
        .await;
    let (token, secret) = match created {
        Ok(created) => created,
        Err(err) => return error_response(&err),
    };

    let cookie = match session_cookie(&format!("{}:{secret}", token.name), state.secure_cookies) {
        Ok(cookie) => cookie,
        Err(err) => return error_response(&AuthError::server(err)),
    };
    (
        StatusCode::FOUND,
        [(LOCATION, final_redirect)],
        [(SET_COOKIE, cookie)],
    )
        .into_response()
}
