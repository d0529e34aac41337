//! Typed provider configuration.
//!
//! Configs are owned by the platform config store and deserialized directly
//! into these structs; the auth core never reads untyped field maps. The
//! only write-back the core performs is the AzureAD endpoint migration,
//! which goes through [`crate::providers::azuread::ConfigWriter`].

use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Policy governing whether an authenticated principal must also appear on
/// the provider allow-list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Unrestricted,
    Restricted,
    Required,
}

/// TTL policy applied by the token manager.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    /// Maximum token TTL in minutes. 0 means no cap.
    pub max_ttl_minutes: i64,
    /// Default TTL in minutes for kubeconfig tokens, clamped to the max.
    pub kubeconfig_default_ttl_minutes: i64,
    /// Login session TTL in minutes. 0 means no expiry.
    pub session_ttl_minutes: i64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            max_ttl_minutes: 0,
            kubeconfig_default_ttl_minutes: 960,
            session_ttl_minutes: 960,
        }
    }
}

fn default_ldap_port() -> u16 {
    389
}

fn default_connection_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Connection and schema settings for an LDAP or Active Directory server.
#[derive(Clone, Debug, Deserialize)]
pub struct LdapConfig {
    #[serde(default)]
    pub enabled: bool,
    pub servers: Vec<String>,
    #[serde(default = "default_ldap_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    pub service_account_dn: String,
    pub service_account_password: SecretString,
    /// When false, the login flow skips the initial service-account bind
    /// and searches with the user's own credential.
    #[serde(default = "default_true")]
    pub service_account_bind_enabled: bool,

    pub user_search_base: String,
    #[serde(default)]
    pub group_search_base: Option<String>,

    pub user_object_class: String,
    pub user_login_attribute: String,
    pub user_name_attribute: String,
    /// Multi-valued attribute on the user entry holding group DNs.
    pub user_member_attribute: String,
    #[serde(default)]
    pub user_search_attribute: String,
    #[serde(default)]
    pub user_enabled_attribute: String,
    #[serde(default)]
    pub user_disabled_bit_mask: i64,

    pub group_object_class: String,
    pub group_name_attribute: String,
    /// Attribute matched against a member DN when resolving groups.
    pub group_dn_attribute: String,
    /// Attribute on a group naming its parent groups ("parent of" walk).
    pub group_member_mapping_attribute: String,
    #[serde(default)]
    pub group_search_attribute: String,
    /// When false, only direct memberships are returned.
    #[serde(default = "default_true")]
    pub nested_group_membership_enabled: bool,

    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub allowed_principal_ids: Vec<String>,
}

impl LdapConfig {
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

fn default_relay_state_ttl_secs() -> u64 {
    300
}

/// Service-provider settings for a SAML identity provider.
#[derive(Clone, Debug, Deserialize)]
pub struct SamlConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Raw IdP metadata XML document.
    pub idp_metadata_xml: String,
    /// PEM-encoded SP signing key and certificate.
    pub sp_key_pem: String,
    pub sp_cert_pem: String,
    pub entity_id: String,
    /// External host the SP endpoints are served under, e.g.
    /// `https://armada.example.com`.
    pub api_host: String,
    /// Where the browser lands after a completed login.
    pub final_redirect_url: String,

    /// Assertion attribute names mapped into the principal.
    pub uid_field: String,
    #[serde(default)]
    pub display_name_field: String,
    #[serde(default)]
    pub user_name_field: String,
    #[serde(default)]
    pub groups_field: String,

    /// Key for signing relay state; rotated with the config.
    pub relay_state_key: SecretString,
    #[serde(default = "default_relay_state_ttl_secs")]
    pub relay_state_ttl_secs: u64,

    /// Bumped by the config store on every change; initialization at an
    /// unchanged version is a no-op.
    pub resource_version: String,

    /// Optional embedded directory used for group search instead of
    /// SAML-native results.
    #[serde(default)]
    pub ldap_group_search: Option<LdapConfig>,

    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub allowed_principal_ids: Vec<String>,
}

impl SamlConfig {
    #[must_use]
    pub fn relay_state_ttl(&self) -> Duration {
        Duration::from_secs(self.relay_state_ttl_secs)
    }
}

/// Marker annotation stamped on an AzureAD config after its endpoints have
/// been rewritten to the modern Graph; migration never runs twice.
pub const AZUREAD_MIGRATED_ANNOTATION: &str = "auth.armada.io/azuread-endpoint-migrated";

/// OAuth and Graph settings for Azure Active Directory.
#[derive(Clone, Debug, Deserialize)]
pub struct AzureAdConfig {
    #[serde(default)]
    pub enabled: bool,
    pub tenant_id: String,
    pub application_id: String,
    pub application_secret: SecretString,
    pub redirect_uri: String,

    pub auth_endpoint: String,
    pub token_endpoint: String,
    pub graph_endpoint: String,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub allowed_principal_ids: Vec<String>,
}

impl AzureAdConfig {
    #[must_use]
    pub fn is_endpoint_migrated(&self) -> bool {
        self.annotations
            .get(AZUREAD_MIGRATED_ANNOTATION)
            .is_some_and(|v| v == "true")
    }
}

/// Settings for the local password provider.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub allowed_principal_ids: Vec<String>,
}
