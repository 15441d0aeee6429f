//! Authentication helpers and token brokering.
//!
//! This module defines the credential and token types used for outbound
//! machine-to-machine authentication, plus the clock abstraction used for
//! expiry decisions. The [`broker::TokenBroker`] performs the OAuth2
//! client-credentials exchange and caches the result.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub mod broker;
pub mod discovery;

pub use broker::{BrokerOptions, TokenBroker};
pub use discovery::OidcDiscovery;

/// How the client authenticates itself at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` and `client_secret` in the form body.
    #[default]
    ClientSecretPost,
    /// HTTP Basic authentication header.
    ClientSecretBasic,
}

/// Where the token endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEndpoint {
    /// Direct token endpoint URL.
    Url(String),
    /// OIDC discovery document URL; `token_endpoint` is read from it on first use.
    Discovery(String),
}

/// Client credentials owned by a single token broker.
#[derive(Debug, Clone)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_endpoint: TokenEndpoint,
    /// Space-separated OAuth scopes requested in the exchange.
    pub scope: String,
    pub auth_method: ClientAuthMethod,
}

impl Credential {
    /// Create a credential for a direct token endpoint URL.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            token_endpoint: TokenEndpoint::Url(token_endpoint.into()),
            scope: scope.into(),
            auth_method: ClientAuthMethod::default(),
        }
    }

    /// Resolve the token endpoint through an OIDC discovery document instead.
    pub fn with_discovery_url(mut self, discovery_url: impl Into<String>) -> Self {
        self.token_endpoint = TokenEndpoint::Discovery(discovery_url.into());
        self
    }

    /// Set the client authentication method.
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }
}

/// An access token obtained through a client-credentials exchange.
///
/// The access token value is kept in a [`SecretString`]; `Debug` output is
/// redacted and the type is deliberately not `Serialize`.
#[derive(Debug, Clone)]
pub struct Token {
    access_token: SecretString,
    expires_at: DateTime<Utc>,
    scope: String,
    token_type: String,
    generation: u64,
}

impl Token {
    /// Create a token. `generation` identifies the exchange that produced it.
    pub fn new(
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        scope: impl Into<String>,
        generation: u64,
    ) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            expires_at,
            scope: scope.into(),
            token_type: "Bearer".to_string(),
            generation,
        }
    }

    /// The secret access token value.
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    /// Absolute expiry instant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Granted scope (space separated).
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Sequence number of the exchange that produced this token.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Value for an `Authorization` header.
    pub fn bearer_header_value(&self) -> String {
        format!("Bearer {}", self.access_token.expose_secret())
    }

    /// Usable for at least `margin` beyond `now`.
    ///
    /// A margin reaching past the representable range means never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|usable_until| usable_until > now)
    }

    /// Past its hard expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock, useful for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
