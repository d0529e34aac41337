//! # Armada Auth
//!
//! Authentication core for the Armada multi-cluster management platform:
//! server-issued session tokens and the identity providers that mint them.
//!
//! ## Tokens
//!
//! A token is an opaque wire value `"<name>:<secret>"`. Only a versioned
//! salted hash of the secret is stored (`$<version>:<salt>:<digest>`),
//! so a leaked store never yields usable credentials. Legacy plaintext
//! records verify once and are rehashed in place. The [`tokens`] module
//! carries the manager (create, derive, verify, TTL clamping), a purge
//! daemon for expired tokens, and the HTTP request-side extraction of
//! token values from cookies and `Authorization` headers.
//!
//! ## Providers
//!
//! Identity resolution is pluggable behind a sealed trait with four
//! variants: local password, LDAP/Active Directory, SAML, and AzureAD.
//! Every provider returns a user [`principal::Principal`] plus its
//! deduplicated group principals, and all of them funnel through the
//! same access-mode allow-list before an identity is accepted.
//!
//! ## Storage
//!
//! Persistence is a port: [`store::TokenStore`] demands atomic
//! create-if-absent and read-your-writes, nothing more. In-memory
//! implementations back the test suite and single-node deployments.

pub mod config;
pub mod errors;
pub mod hash;
pub mod principal;
pub mod providers;
pub mod store;
pub mod tokens;

pub use errors::{AuthError, Result};
