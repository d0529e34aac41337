//! Error taxonomy surfaced to callers of the authentication core.
//!
//! Provider-level failures (LDAP binds, SAML signature checks, Graph calls)
//! are wrapped with context for logs but reach the caller only as one of
//! these kinds; raw protocol errors never leak to end users.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad credential, signature, or assertion. Safe to show generically.
    #[error("authentication failed")]
    Unauthorized(#[source] Option<anyhow::Error>),

    /// Authenticated but not on the configured allow-list.
    #[error("permission denied")]
    PermissionDenied,

    /// Token or assertion past its validity window.
    #[error("expired")]
    Expired,

    /// Unknown token, principal, or secret.
    #[error("{0} not found")]
    NotFound(String),

    /// Presented secret does not verify against the stored hash.
    #[error("token mismatch")]
    SecretMismatch,

    /// Malformed hash string, relay state, or principal id.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Network failure, timeout, or unexpected directory response.
    #[error("server error")]
    ServerError(#[source] anyhow::Error),
}

impl AuthError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized(None)
    }

    pub fn unauthorized_from(err: impl Into<anyhow::Error>) -> Self {
        Self::Unauthorized(Some(err.into()))
    }

    pub fn server(err: impl Into<anyhow::Error>) -> Self {
        Self::ServerError(err.into())
    }

    /// HTTP-equivalent status for this error kind, used by embedders when
    /// shaping responses. Secret mismatch maps to 422 and expiry to 410 so
    /// clients can tell a dead session from a bad one.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::PermissionDenied => 403,
            Self::Expired => 410,
            Self::NotFound(_) => 404,
            Self::SecretMismatch => 422,
            Self::InvalidFormat(_) => 422,
            Self::ServerError(_) => 500,
        }
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_generic() {
        let err = AuthError::unauthorized_from(anyhow::anyhow!(
            "LDAP result code 49: invalid credentials for cn=alice"
        ));
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(AuthError::unauthorized().http_status(), 401);
        assert_eq!(AuthError::PermissionDenied.http_status(), 403);
        assert_eq!(AuthError::Expired.http_status(), 410);
        assert_eq!(AuthError::NotFound("token".into()).http_status(), 404);
        assert_eq!(AuthError::SecretMismatch.http_status(), 422);
        assert_eq!(
            AuthError::InvalidFormat("bad hash".into()).http_status(),
            422
        );
    }
}
