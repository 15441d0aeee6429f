//! OIDC discovery document support.
//!
//! Identity providers publish `/.well-known/openid-configuration` with the
//! issuer, token endpoint and JWKS location. Both the token broker (token
//! endpoint) and the gateway authenticator (issuer, key set) can be pointed
//! at a discovery URL instead of individual endpoints.

use serde::Deserialize;
use thiserror::Error;

/// Failure to obtain or parse a discovery document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("OIDC discovery failed for {url}: {reason}")]
pub struct DiscoveryError {
    pub url: String,
    pub reason: String,
}

/// Subset of the OIDC provider metadata this crate uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    pub jwks_uri: String,
}

impl OidcDiscovery {
    /// Fetch and parse the discovery document at `url`.
    pub async fn fetch(http: &reqwest::Client, url: &str) -> Result<Self, DiscoveryError> {
        let fail = |reason: String| DiscoveryError {
            url: url.to_string(),
            reason,
        };

        let resp = http
            .get(url)
            .send()
            .await
            .map_err(|e| fail(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("http={}", status.as_u16())));
        }

        resp.json::<Self>()
            .await
            .map_err(|e| fail(format!("malformed document: {e}")))
    }

    /// The token endpoint, required when the document is used for token exchange.
    pub fn require_token_endpoint(&self, url: &str) -> Result<&str, DiscoveryError> {
        self.token_endpoint
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DiscoveryError {
                url: url.to_string(),
                reason: "document has no token_endpoint".to_string(),
            })
    }
}
