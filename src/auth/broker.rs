//! OAuth2 client-credentials token broker.
//!
//! The broker acquires access tokens for one [`Credential`], caches them in
//! memory and refreshes them before expiry. Refresh is single-flight: the
//! exchange runs on a detached task and every concurrent caller awaits the
//! same shared result, so a burst of callers never produces more than one
//! exchange against the identity provider. Because the task is detached, a
//! caller that abandons `get_token()` does not cancel the exchange; the
//! result still lands in the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::Instrument;

use super::{
    ClientAuthMethod, Clock, Credential, OidcDiscovery, SystemClock, Token, TokenEndpoint,
};
use crate::error::AuthError;

/// Default refresh margin before expiry
const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Default budget for one exchange (discovery included)
const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

type ExchangeFuture = Shared<BoxFuture<'static, Result<Token, AuthError>>>;

/// Tunables for a [`TokenBroker`].
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Tokens closer than this to expiry are refreshed.
    pub safety_margin: Duration,
    /// Upper bound for a single token exchange.
    pub exchange_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }
}

impl BrokerOptions {
    pub const fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub const fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// The margin as a signed delta, saturating at `TimeDelta::MAX`.
    fn margin(&self) -> TimeDelta {
        i64::try_from(self.safety_margin.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
}

struct InFlight {
    generation: u64,
    exchange: ExchangeFuture,
}

#[derive(Default)]
struct BrokerState {
    cached: Option<Token>,
    /// Set once a stale token was handed out after a failed refresh.
    grace_used: bool,
    in_flight: Option<InFlight>,
}

impl BrokerState {
    fn finish(&mut self, generation: u64) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
        {
            self.in_flight = None;
        }
    }
}

/// Clears the in-flight slot when the exchange task ends, including by panic.
struct InFlightGuard {
    inner: Arc<BrokerInner>,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.clear_in_flight(self.generation);
    }
}

struct BrokerInner {
    credential: Credential,
    http: reqwest::Client,
    options: BrokerOptions,
    clock: Arc<dyn Clock>,
    resolved_endpoint: OnceCell<String>,
    state: Mutex<BrokerState>,
    exchanges: AtomicU64,
}

/// Caching, single-flight client-credentials token broker.
///
/// Cloning is cheap and clones share the same cache.
#[derive(Clone)]
pub struct TokenBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker")
            .field("client_id", &self.inner.credential.client_id)
            .field("scope", &self.inner.credential.scope)
            .field("exchanges", &self.exchange_count())
            .finish_non_exhaustive()
    }
}

impl TokenBroker {
    /// Create a broker with default options and the system clock.
    pub fn new(credential: Credential, http: reqwest::Client) -> Self {
        Self::with_options(credential, http, BrokerOptions::default())
    }

    pub fn with_options(credential: Credential, http: reqwest::Client, options: BrokerOptions) -> Self {
        Self::with_clock(credential, http, options, Arc::new(SystemClock))
    }

    /// Create a broker with an explicit clock (tests drive expiry through it).
    pub fn with_clock(
        credential: Credential,
        http: reqwest::Client,
        options: BrokerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                credential,
                http,
                options,
                clock,
                resolved_endpoint: OnceCell::new(),
                state: Mutex::new(BrokerState::default()),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Return a token valid beyond the safety margin, exchanging for a new
    /// one when the cache is empty or stale.
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        let exchange = {
            let mut state = self.inner.lock_state();
            let now = self.inner.clock.now();
            if let Some(token) = state.cached.as_ref()
                && token.is_fresh(now, self.inner.options.margin())
            {
                return Ok(token.clone());
            }
            match &state.in_flight {
                Some(existing) => existing.exchange.clone(),
                None => {
                    let (generation, started) = Arc::clone(&self.inner).start_exchange();
                    state.in_flight = Some(InFlight {
                        generation,
                        exchange: started.clone(),
                    });
                    started
                }
            }
        };

        match exchange.await {
            Ok(token) => Ok(token),
            Err(err) => self.inner.stale_fallback(err),
        }
    }

    /// Discard the cached token; the next `get_token()` performs an exchange.
    pub fn invalidate(&self) {
        let mut state = self.inner.lock_state();
        if state.cached.take().is_some() {
            tracing::debug!(
                client_id = %self.inner.credential.client_id,
                "cached token invalidated"
            );
        }
        state.grace_used = false;
    }

    /// Number of exchanges started by this broker.
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.credential.client_id
    }

    /// Scope requested by this broker's credential.
    pub fn scope(&self) -> &str {
        &self.inner.credential.scope
    }

    /// Whether two handles share the same cache.
    pub fn same_broker(&self, other: &TokenBroker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl BrokerInner {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the in-flight exchange if it is still the one for `generation`.
    fn clear_in_flight(&self, generation: u64) {
        self.lock_state().finish(generation);
    }

    /// Spawn the exchange on its own task so it outlives any single caller.
    ///
    /// Must be called with the state lock held; the task cannot touch the
    /// in-flight slot before the caller has filled it.
    fn start_exchange(self: Arc<Self>) -> (u64, ExchangeFuture) {
        let generation = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        let span = tracing::debug_span!(
            "token_exchange",
            client_id = %self.credential.client_id,
            generation
        );
        let handle = tokio::spawn(
            async move {
                let _guard = InFlightGuard {
                    inner: Arc::clone(&self),
                    generation,
                };
                self.run_exchange(generation).await
            }
            .instrument(span),
        );
        let exchange = async move {
            handle.await.unwrap_or_else(|e| {
                Err(AuthError::TokenExchangeFailed(format!(
                    "exchange task aborted: {e}"
                )))
            })
        }
        .boxed()
        .shared();
        (generation, exchange)
    }

    async fn run_exchange(&self, generation: u64) -> Result<Token, AuthError> {
        tracing::debug!(
            client_id = %self.credential.client_id,
            scope = %self.credential.scope,
            generation,
            "starting client-credentials exchange"
        );

        let timeout = self.options.exchange_timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(generation)).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::TokenExchangeFailed(format!(
                "token exchange timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        let mut state = self.lock_state();
        state.finish(generation);
        match &result {
            Ok(token) => {
                state.cached = Some(token.clone());
                state.grace_used = false;
                tracing::debug!(
                    client_id = %self.credential.client_id,
                    generation,
                    expires_at = %token.expires_at(),
                    "token exchange succeeded"
                );
            }
            Err(err) => {
                tracing::warn!(
                    client_id = %self.credential.client_id,
                    generation,
                    error.kind = err.kind(),
                    error.message = %err,
                    "token exchange failed"
                );
            }
        }
        result
    }

    async fn token_endpoint(&self) -> Result<&str, AuthError> {
        match &self.credential.token_endpoint {
            TokenEndpoint::Url(url) => Ok(url.as_str()),
            TokenEndpoint::Discovery(url) => self
                .resolved_endpoint
                .get_or_try_init(|| async {
                    let doc = OidcDiscovery::fetch(&self.http, url)
                        .await
                        .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;
                    doc.require_token_endpoint(url)
                        .map(str::to_string)
                        .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))
                })
                .await
                .map(String::as_str),
        }
    }

    async fn exchange(&self, generation: u64) -> Result<Token, AuthError> {
        let endpoint = self.token_endpoint().await?;
        let cred = &self.credential;

        let mut form: Vec<(&str, &str)> = vec![("grant_type", "client_credentials")];
        if !cred.scope.is_empty() {
            form.push(("scope", cred.scope.as_str()));
        }

        let mut request = self.http.post(endpoint);
        match cred.auth_method {
            ClientAuthMethod::ClientSecretPost => {
                form.push(("client_id", cred.client_id.as_str()));
                form.push(("client_secret", cred.client_secret.expose_secret()));
            }
            ClientAuthMethod::ClientSecretBasic => {
                request = request.basic_auth(&cred.client_id, Some(cred.client_secret.expose_secret()));
            }
        }

        let resp = request.form(&form).send().await.map_err(|e| {
            AuthError::TokenExchangeFailed(format!("token endpoint request failed: {}", e.without_url()))
        })?;

        let status = resp.status();
        if !status.is_success() {
            // Only the OAuth error code is surfaced; bodies may echo request data.
            let body = resp.text().await.unwrap_or_default();
            let code = serde_json::from_str::<OAuthErrorBody>(&body)
                .map(|b| format!(" error={}", b.error))
                .unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed(format!(
                "token endpoint returned http={}{code}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = resp.json().await.map_err(|e| {
            AuthError::TokenExchangeFailed(format!("malformed token response: {}", e.without_url()))
        })?;

        if body.access_token.is_empty() {
            return Err(AuthError::TokenExchangeFailed(
                "malformed token response: empty access_token".to_string(),
            ));
        }
        match body.token_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("bearer") => {}
            other => {
                return Err(AuthError::TokenExchangeFailed(format!(
                    "malformed token response: unsupported token_type {other:?}"
                )));
            }
        }
        if body.expires_in <= 0 {
            return Err(AuthError::TokenExchangeFailed(format!(
                "malformed token response: expires_in={}",
                body.expires_in
            )));
        }

        let margin = self.options.margin();
        let lifetime = TimeDelta::try_seconds(body.expires_in).ok_or_else(|| {
            AuthError::TokenExchangeFailed(
                "malformed token response: expires_in out of range".to_string(),
            )
        })?;
        if lifetime <= margin {
            return Err(AuthError::TokenExchangeFailed(format!(
                "malformed token response: expires_in={} does not exceed the {}s safety margin",
                body.expires_in,
                margin.num_seconds()
            )));
        }
        let expires_at = self.clock.now().checked_add_signed(lifetime).ok_or_else(|| {
            AuthError::TokenExchangeFailed(
                "malformed token response: expires_in out of range".to_string(),
            )
        })?;
        let scope = body
            .scope
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| cred.scope.clone());
        Ok(Token::new(body.access_token, expires_at, scope, generation))
    }

    /// After a failed refresh, hand out the previous token once if it has not
    /// reached its hard expiry; otherwise propagate the failure.
    fn stale_fallback(&self, err: AuthError) -> Result<Token, AuthError> {
        let mut state = self.lock_state();
        let now = self.clock.now();
        if !state.grace_used
            && let Some(token) = state.cached.as_ref()
            && !token.is_expired(now)
        {
            let token = token.clone();
            state.grace_used = true;
            tracing::warn!(
                client_id = %self.credential.client_id,
                generation = token.generation(),
                expires_at = %token.expires_at(),
                "refresh failed; serving cached token one final time"
            );
            return Ok(token);
        }
        Err(err)
    }
}
