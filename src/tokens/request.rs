//! Credential extraction from inbound requests and session cookie handling.

use axum::http::header::{InvalidHeaderValue, AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;

use crate::errors::{AuthError, Result};
use crate::tokens::manager::TokenManager;
use crate::tokens::Token;

/// Session cookie carrying `"<tokenName>:<rawSecret>"`.
pub const SESSION_COOKIE_NAME: &str = "R_SESS";

/// Fixed past expiry stamped on the clearing cookie so every client drops it.
const CLEARED_COOKIE_EXPIRES: &str = "Wed, 10 Feb 1982 23:00:00 GMT";

/// Authenticates inbound requests by extracting the wire token value and
/// delegating to the token manager.
pub struct RequestAuthenticator {
    manager: Arc<TokenManager>,
}

impl RequestAuthenticator {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        Self { manager }
    }

    /// Resolve the request's credential to a verified token.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Token> {
        let Some(value) = extract_token_auth_value(headers) else {
            return Err(AuthError::unauthorized());
        };
        self.manager.verify_and_fetch(&value).await
    }

    /// Delete the session named by the request's credential. Absent or
    /// already-deleted sessions are success; logout is idempotent.
    pub async fn logout(&self, headers: &HeaderMap) -> Result<()> {
        let Some(value) = extract_token_auth_value(headers) else {
            return Ok(());
        };
        let Some((name, _)) = super::split_token_parts(&value) else {
            return Ok(());
        };
        self.manager.delete_by_name(name).await
    }
}

/// Pull the wire token value from a bearer header, the session cookie, or
/// HTTP Basic credentials (whose decoded `user:pass` pair is itself the
/// `name:secret` pair).
#[must_use]
pub fn extract_token_auth_value(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let trimmed = value.trim();
        if let Some(token) = trimmed
            .strip_prefix("Bearer ")
            .or_else(|| trimmed.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        if let Some(encoded) = trimmed.strip_prefix("Basic ") {
            if let Ok(decoded) = STANDARD.decode(encoded.trim()) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    if !pair.is_empty() {
                        return Some(pair);
                    }
                }
            }
        }
    }

    let cookie_header = headers.get(COOKIE)?.to_str().ok()?;
    for pair in cookie_header.split(';') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if key.trim() == SESSION_COOKIE_NAME && !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Build the session cookie for a freshly issued token value.
///
/// `secure` mirrors the request scheme so plain-HTTP deployments still get
/// a cookie back.
pub fn session_cookie(
    token_value: &str,
    secure: bool,
) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}={token_value}; Path=/; HttpOnly");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Build the logout cookie: emptied value, zero `Max-Age`, and a fixed past
/// `Expires` to force deletion on clients that ignore `Max-Age`.
pub fn clear_session_cookie(
    secure: bool,
) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=0; Expires={CLEARED_COOKIE_EXPIRES}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer token-abc12:s3cr3t"),
        );
        assert_eq!(
            extract_token_auth_value(&headers).as_deref(),
            Some("token-abc12:s3cr3t")
        );
    }

    #[test]
    fn cookie_extracted_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; R_SESS=token-abc12:s3cr3t; lang=en"),
        );
        assert_eq!(
            extract_token_auth_value(&headers).as_deref(),
            Some("token-abc12:s3cr3t")
        );
    }

    #[test]
    fn basic_auth_reinterpreted_as_token_pair() {
        let encoded = STANDARD.encode("token-abc12:s3cr3t");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert_eq!(
            extract_token_auth_value(&headers).as_deref(),
            Some("token-abc12:s3cr3t")
        );
    }

    #[test]
    fn missing_credential_is_none() {
        assert_eq!(extract_token_auth_value(&HeaderMap::new()), None);
    }

    #[test]
    fn session_cookie_attributes() {
        let cookie = session_cookie("token-abc12:s3cr3t", true).unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.starts_with("R_SESS=token-abc12:s3cr3t"));
        assert!(value.contains("Path=/"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));

        let insecure = session_cookie("t:s", false).unwrap();
        assert!(!insecure.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn clear_cookie_forces_deletion() {
        let cookie = clear_session_cookie(false).unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.contains("Max-Age=0"));
        assert!(value.contains("Expires=Wed, 10 Feb 1982 23:00:00 GMT"));
    }
}
