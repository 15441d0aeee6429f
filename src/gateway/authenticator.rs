//! Inbound bearer token validation.
//!
//! Tokens are JWTs signed by the identity provider. Verification covers the
//! signature (against the provider's JSON Web Key Set), the algorithm
//! allow-list, issuer, expiry and the gateway's resource indicator
//! (audience and/or client id).

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::auth::OidcDiscovery;
use crate::config::{GatewaySettings, TimeoutSettings};
use crate::error::{AuthError, ConfigError};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);
const DEFAULT_MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(5);

/// Where verification keys come from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A fixed key set.
    Static(JwkSet),
    /// A remote JWKS document.
    JwksUri(String),
    /// An OIDC discovery document naming the JWKS location and issuer.
    Discovery(String),
}

#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    /// Expected `iss`. May be omitted with [`KeySource::Discovery`].
    pub issuer: Option<String>,
    pub key_source: KeySource,
    pub audiences: Vec<String>,
    pub allowed_clients: Vec<String>,
    pub algorithms: Vec<Algorithm>,
    pub leeway: Duration,
    pub fetch_timeout: Duration,
    pub cache_ttl: Duration,
    /// An unknown kid refetches the key set only when the cached copy is
    /// at least this old.
    pub min_refetch_interval: Duration,
}

impl AuthenticatorConfig {
    pub fn new(issuer: Option<String>, key_source: KeySource) -> Self {
        Self {
            issuer,
            key_source,
            audiences: Vec::new(),
            allowed_clients: Vec::new(),
            algorithms: vec![Algorithm::RS256],
            leeway: DEFAULT_LEEWAY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            min_refetch_interval: DEFAULT_MIN_REFETCH_INTERVAL,
        }
    }

    pub fn with_audiences<I: IntoIterator<Item = S>, S: Into<String>>(mut self, audiences: I) -> Self {
        self.audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_clients<I: IntoIterator<Item = S>, S: Into<String>>(mut self, clients: I) -> Self {
        self.allowed_clients = clients.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    /// Build from the `gateway` and `timeouts` settings sections.
    pub fn from_settings(gateway: &GatewaySettings, timeouts: &TimeoutSettings) -> Result<Self, ConfigError> {
        let key_source = match (&gateway.jwks_uri, &gateway.discovery_url) {
            (Some(uri), _) => KeySource::JwksUri(uri.clone()),
            (None, Some(url)) => KeySource::Discovery(url.clone()),
            (None, None) => {
                return Err(ConfigError::Missing(
                    "gateway.jwks_uri or gateway.discovery_url".to_string(),
                ));
            }
        };
        Ok(Self::new(gateway.issuer.clone(), key_source)
            .with_audiences(gateway.audiences.iter().cloned())
            .with_allowed_clients(gateway.allowed_clients.iter().cloned())
            .with_algorithms(gateway.algorithms.clone())
            .with_leeway(Duration::from_secs(gateway.leeway_secs))
            .with_fetch_timeout(timeouts.gateway_auth())
            .with_cache_ttl(Duration::from_secs(gateway.jwks_cache_ttl_secs))
            .with_min_refetch_interval(Duration::from_secs(gateway.jwks_min_refetch_secs)))
    }
}

/// Validated token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub subject: String,
    pub issuer: String,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub audiences: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn has_any_scope(&self, scopes: &[String]) -> bool {
        scopes.iter().any(|s| self.has_scope(s))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => s.split_whitespace().map(str::to_string).collect(),
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    iss: String,
    exp: i64,
    #[serde(default)]
    aud: Option<OneOrMany>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<OneOrMany>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    azp: Option<String>,
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_from_header(value: &str) -> Result<&str, AuthError> {
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| AuthError::InvalidToken("expected Bearer authorization".to_string()))?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::InvalidToken("expected Bearer authorization".to_string()));
    }
    Ok(token)
}

struct RemoteLocation {
    jwks_uri: String,
    issuer: Option<String>,
}

struct KeyCache {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Validates bearer tokens presented to the gateway.
pub struct GatewayAuthenticator {
    config: AuthenticatorConfig,
    http: reqwest::Client,
    location: OnceCell<RemoteLocation>,
    cache: Mutex<Option<KeyCache>>,
    refresh: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for GatewayAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayAuthenticator")
            .field("issuer", &self.config.issuer)
            .field("audiences", &self.config.audiences)
            .field("allowed_clients", &self.config.allowed_clients)
            .field("algorithms", &self.config.algorithms)
            .finish_non_exhaustive()
    }
}

impl GatewayAuthenticator {
    pub fn new(config: AuthenticatorConfig, http: reqwest::Client) -> Result<Self, ConfigError> {
        if config.audiences.is_empty() && config.allowed_clients.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway must accept at least one audience or client".to_string(),
            ));
        }
        if config.algorithms.is_empty() {
            return Err(ConfigError::Invalid("no token algorithms allowed".to_string()));
        }
        if config.issuer.is_none() && !matches!(config.key_source, KeySource::Discovery(_)) {
            return Err(ConfigError::Missing("gateway.issuer".to_string()));
        }
        Ok(Self {
            config,
            http,
            location: OnceCell::new(),
            cache: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
        })
    }

    /// Validate a bearer token and return its claims.
    pub async fn authenticate(&self, bearer: &str) -> Result<Claims, AuthError> {
        let result = self.verify(bearer).await;
        if let Err(err) = &result {
            tracing::warn!(error.kind = err.kind(), "bearer token rejected");
        }
        result
    }

    async fn verify(&self, bearer: &str) -> Result<Claims, AuthError> {
        let header = jsonwebtoken::decode_header(bearer)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token: {e}")))?;
        if !self.config.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let timeout = self.config.fetch_timeout;
        let (issuer, key) = tokio::time::timeout(timeout, self.issuer_and_key(header.kid.as_deref()))
            .await
            .map_err(|_| {
                AuthError::KeySetUnavailable(format!(
                    "key set fetch timed out after {}ms",
                    timeout.as_millis()
                ))
            })??;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = self.config.leeway.as_secs();

        let data = jsonwebtoken::decode::<RawClaims>(bearer, &key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken("token has expired".to_string()),
                ErrorKind::InvalidIssuer => AuthError::InvalidToken("unexpected issuer".to_string()),
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        self.into_claims(data.claims)
    }

    fn into_claims(&self, raw: RawClaims) -> Result<Claims, AuthError> {
        let audiences = raw.aud.map(OneOrMany::into_vec).unwrap_or_default();
        let client_id = raw.client_id.or(raw.azp);

        if !self.config.audiences.is_empty()
            && !audiences.iter().any(|a| self.config.audiences.contains(a))
        {
            return Err(AuthError::InvalidToken("audience not accepted".to_string()));
        }
        if !self.config.allowed_clients.is_empty()
            && !client_id
                .as_ref()
                .is_some_and(|c| self.config.allowed_clients.contains(c))
        {
            return Err(AuthError::InvalidToken("client not accepted".to_string()));
        }

        let expires_at = DateTime::from_timestamp(raw.exp, 0)
            .ok_or_else(|| AuthError::InvalidToken("exp out of range".to_string()))?;

        let mut scopes: Vec<String> = raw
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        for scope in raw.scp.map(OneOrMany::into_vec).unwrap_or_default() {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }

        let subject = raw
            .sub
            .or_else(|| client_id.clone())
            .ok_or_else(|| AuthError::InvalidToken("token has no subject".to_string()))?;

        Ok(Claims {
            subject,
            issuer: raw.iss,
            scopes,
            client_id,
            audiences,
            expires_at,
        })
    }

    async fn issuer_and_key(&self, kid: Option<&str>) -> Result<(String, DecodingKey), AuthError> {
        let (issuer, jwk) = match &self.config.key_source {
            KeySource::Static(keys) => {
                let issuer = self.configured_issuer()?;
                let jwk = select_key(keys, kid).cloned().ok_or_else(|| unknown_key(kid))?;
                (issuer, jwk)
            }
            KeySource::JwksUri(_) | KeySource::Discovery(_) => {
                let location = self.location().await?;
                let issuer = match (&self.config.issuer, &location.issuer) {
                    (Some(issuer), _) | (None, Some(issuer)) => issuer.clone(),
                    (None, None) => self.configured_issuer()?,
                };
                (issuer, self.remote_key(&location.jwks_uri, kid).await?)
            }
        };

        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::InvalidToken(format!("unusable signing key: {e}")))?;
        Ok((issuer, key))
    }

    fn configured_issuer(&self) -> Result<String, AuthError> {
        self.config
            .issuer
            .clone()
            .ok_or_else(|| AuthError::KeySetUnavailable("issuer is not known".to_string()))
    }

    async fn location(&self) -> Result<&RemoteLocation, AuthError> {
        self.location
            .get_or_try_init(|| async {
                match &self.config.key_source {
                    KeySource::Discovery(url) => {
                        let doc = OidcDiscovery::fetch(&self.http, url)
                            .await
                            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;
                        Ok(RemoteLocation {
                            jwks_uri: doc.jwks_uri,
                            issuer: Some(doc.issuer),
                        })
                    }
                    KeySource::JwksUri(uri) => Ok(RemoteLocation {
                        jwks_uri: uri.clone(),
                        issuer: None,
                    }),
                    KeySource::Static(_) => Err(AuthError::KeySetUnavailable(
                        "static key set has no remote location".to_string(),
                    )),
                }
            })
            .await
    }

    /// Look the key up in the cached set, refetching when the cache is stale
    /// or when the kid is unknown and the cached set is older than the
    /// minimum refetch interval.
    async fn remote_key(&self, jwks_uri: &str, kid: Option<&str>) -> Result<Jwk, AuthError> {
        let observed = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            match cache.as_ref() {
                Some(entry) if entry.fetched_at.elapsed() < self.config.cache_ttl => {
                    if let Some(jwk) = select_key(&entry.keys, kid) {
                        return Ok(jwk.clone());
                    }
                    if entry.fetched_at.elapsed() < self.config.min_refetch_interval {
                        tracing::debug!(kid, "unknown key id within the refetch interval");
                        return Err(unknown_key(kid));
                    }
                    Some(entry.fetched_at)
                }
                Some(entry) => Some(entry.fetched_at),
                None => None,
            }
        };

        let _guard = self.refresh.lock().await;

        // Another request may have refreshed while this one waited.
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.as_ref()
                && Some(entry.fetched_at) != observed
            {
                return select_key(&entry.keys, kid).cloned().ok_or_else(|| unknown_key(kid));
            }
        }

        let keys = self.fetch_keys(jwks_uri).await?;
        let jwk = select_key(&keys, kid).cloned();
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(KeyCache {
            keys,
            fetched_at: Instant::now(),
        });
        jwk.ok_or_else(|| unknown_key(kid))
    }

    async fn fetch_keys(&self, jwks_uri: &str) -> Result<JwkSet, AuthError> {
        tracing::debug!(jwks_uri, "fetching key set");
        let resp = self.http.get(jwks_uri).send().await.map_err(|e| {
            AuthError::KeySetUnavailable(format!("key set request failed: {}", e.without_url()))
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::KeySetUnavailable(format!(
                "key set endpoint returned http={}",
                status.as_u16()
            )));
        }
        resp.json::<JwkSet>().await.map_err(|e| {
            AuthError::KeySetUnavailable(format!("malformed key set: {}", e.without_url()))
        })
    }
}

fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

fn unknown_key(kid: Option<&str>) -> AuthError {
    match kid {
        Some(kid) => AuthError::InvalidToken(format!("unknown signing key id {kid}")),
        None => AuthError::InvalidToken("token has no key id".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_from_header("Bearer abc.def.ghi").unwrap(), "abc.def.ghi");
        assert_eq!(bearer_from_header("bearer  xyz ").unwrap(), "xyz");
        assert!(bearer_from_header("Basic abc").is_err());
        assert!(bearer_from_header("Bearer").is_err());
    }

    #[test]
    fn requires_a_resource_indicator() {
        let config = AuthenticatorConfig::new(Some("https://idp".into()), KeySource::Static(JwkSet { keys: vec![] }));
        let err = GatewayAuthenticator::new(config, reqwest::Client::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn claims_scope_checks() {
        let claims = Claims {
            subject: "client".into(),
            issuer: "https://idp".into(),
            scopes: vec!["orders:read".into()],
            client_id: Some("client".into()),
            audiences: vec![],
            expires_at: Utc::now(),
        };
        assert!(claims.has_scope("orders:read"));
        assert!(claims.has_any_scope(&["orders:write".into(), "orders:read".into()]));
        assert!(!claims.has_any_scope(&["orders:write".into()]));
    }
}
