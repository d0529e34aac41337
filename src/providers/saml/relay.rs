//! Signed relay state for the SSO redirect/callback handshake.
//!
//! A relay token binds an outgoing AuthnRequest id to the redirect the
//! browser should land on afterwards. Tokens are HMAC-signed so the
//! callback can trust them, and additionally tracked in an outstanding
//! set so each one redeems at most once. A callback carrying a relay
//! token we did not issue, or one past its TTL, is rejected outright.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::{AuthError, Result};

type HmacSha256 = Hmac<Sha256>;

/// What a relay token binds together.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayClaims {
    pub request_id: String,
    pub redirect_uri: String,
    pub issued_at: DateTime<Utc>,
}

pub struct RelayStates {
    key: SecretString,
    ttl: Duration,
    outstanding: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RelayStates {
    #[must_use]
    pub fn new(key: SecretString, ttl: Duration) -> Self {
        Self {
            key,
            ttl,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn mac(&self, payload: &str) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(AuthError::server)?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Sign a relay token for an outgoing AuthnRequest and record it as
    /// outstanding.
    pub fn issue(&self, request_id: &str, redirect_uri: &str) -> Result<String> {
        let claims = RelayClaims {
            request_id: request_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            issued_at: Utc::now(),
        };
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).map_err(AuthError::server)?);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&payload)?);

        self.prune_expired()?;
        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| AuthError::server(anyhow::anyhow!("relay state lock poisoned")))?;
        outstanding.insert(claims.request_id.clone(), claims.issued_at);

        Ok(format!("{payload}.{signature}"))
    }

    /// Drop outstanding entries past the TTL. Runs on both issue and
    /// redeem so abandoned handshakes do not accumulate.
    fn prune_expired(&self) -> Result<()> {
        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| AuthError::server(anyhow::anyhow!("relay state lock poisoned")))?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        outstanding.retain(|_, issued| *issued > cutoff);
        Ok(())
    }

    #[cfg(test)]
    fn outstanding_len(&self) -> usize {
        self.outstanding.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Validate and consume a relay token presented on the callback.
    pub fn redeem(&self, token: &str) -> Result<RelayClaims> {
        self.prune_expired()?;
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| AuthError::InvalidFormat("relay state".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidFormat("relay state".into()))?;

        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(AuthError::server)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::unauthorized())?;

        let claims: RelayClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or_else(|| AuthError::InvalidFormat("relay state".into()))?;

        let age = Utc::now().signed_duration_since(claims.issued_at);
        if age.to_std().map_or(true, |age| age > self.ttl) {
            return Err(AuthError::unauthorized());
        }

        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| AuthError::server(anyhow::anyhow!("relay state lock poisoned")))?;
        if outstanding.remove(&claims.request_id).is_none() {
            return Err(AuthError::unauthorized());
        }
        Ok(claims)
    }
}
