//! Configuration
//!
//! Settings are handed to this core by external provisioning collaborators:
//! client credentials, token endpoint, gateway URL and validation rules,
//! the workload-to-scope mapping, and per-stage timeouts. They can be loaded
//! from a JSON document or from the environment variables written by the
//! provisioning scripts.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::auth::{BrokerOptions, ClientAuthMethod, Credential, TokenEndpoint};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Provider name used when settings come from the environment.
pub const DEFAULT_PROVIDER_NAME: &str = "agentcore-identity-for-gateway";
/// Workload identifier used when `WORKLOAD_USER_ID` is not set.
pub const DEFAULT_WORKLOAD_USER_ID: &str = "test-user-123";

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Root settings document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Named OAuth2 credential providers.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Registered workload identities.
    #[serde(default)]
    pub workloads: Vec<WorkloadSettings>,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub token: TokenSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// One OAuth2 client registration at the identity provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub client_id: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
}

impl ProviderSettings {
    /// Build the credential for one resource scope.
    pub fn credential(&self, scope: &str) -> Result<Credential, ConfigError> {
        let token_endpoint = match (&self.token_endpoint, &self.discovery_url) {
            (Some(url), _) if !url.is_empty() => TokenEndpoint::Url(url.clone()),
            (_, Some(url)) if !url.is_empty() => TokenEndpoint::Discovery(url.clone()),
            _ => {
                return Err(ConfigError::Missing(format!(
                    "token_endpoint or discovery_url for client '{}'",
                    self.client_id
                )));
            }
        };
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing("client_id".to_string()));
        }
        Ok(Credential {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            token_endpoint,
            scope: scope.to_string(),
            auth_method: self.auth_method,
        })
    }
}

/// A workload identity and the scope its tokens are requested for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSettings {
    pub workload_user_id: String,
    pub provider: String,
    #[serde(default)]
    pub resource_scope: String,
}

/// Inbound validation rules and location of the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    /// Base URL of the gateway, used by remote transports.
    #[serde(default)]
    pub url: Option<String>,
    /// Expected `iss`; taken from the discovery document when omitted.
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Accepted `aud` values (resource indicators).
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Accepted `client_id` values.
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<Algorithm>,
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
    #[serde(default = "default_jwks_cache_ttl_secs")]
    pub jwks_cache_ttl_secs: u64,
    /// Minimum age of the cached key set before an unknown kid refetches it.
    #[serde(default = "default_jwks_min_refetch_secs")]
    pub jwks_min_refetch_secs: u64,
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256]
}

const fn default_leeway_secs() -> u64 {
    60
}

const fn default_jwks_cache_ttl_secs() -> u64 {
    3600
}

const fn default_jwks_min_refetch_secs() -> u64 {
    5
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: None,
            issuer: None,
            jwks_uri: None,
            discovery_url: None,
            audiences: Vec::new(),
            allowed_clients: Vec::new(),
            algorithms: default_algorithms(),
            leeway_secs: default_leeway_secs(),
            jwks_cache_ttl_secs: default_jwks_cache_ttl_secs(),
            jwks_min_refetch_secs: default_jwks_min_refetch_secs(),
        }
    }
}

/// Independent per-stage budgets, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default = "default_token_exchange_ms")]
    pub token_exchange_ms: u64,
    #[serde(default = "default_gateway_auth_ms")]
    pub gateway_auth_ms: u64,
    #[serde(default = "default_backend_call_ms")]
    pub backend_call_ms: u64,
    #[serde(default = "default_gateway_request_ms")]
    pub gateway_request_ms: u64,
}

const fn default_token_exchange_ms() -> u64 {
    10_000
}

const fn default_gateway_auth_ms() -> u64 {
    5_000
}

const fn default_backend_call_ms() -> u64 {
    30_000
}

const fn default_gateway_request_ms() -> u64 {
    30_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            token_exchange_ms: default_token_exchange_ms(),
            gateway_auth_ms: default_gateway_auth_ms(),
            backend_call_ms: default_backend_call_ms(),
            gateway_request_ms: default_gateway_request_ms(),
        }
    }
}

impl TimeoutSettings {
    pub const fn token_exchange(&self) -> Duration {
        Duration::from_millis(self.token_exchange_ms)
    }

    pub const fn gateway_auth(&self) -> Duration {
        Duration::from_millis(self.gateway_auth_ms)
    }

    pub const fn backend_call(&self) -> Duration {
        Duration::from_millis(self.backend_call_ms)
    }

    pub const fn gateway_request(&self) -> Duration {
        Duration::from_millis(self.gateway_request_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenSettings {
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

const fn default_safety_margin_secs() -> u64 {
    60
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
        }
    }
}

/// Orchestrator retry policy for `BackendUnavailable` results.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Settings {
    /// Parse settings from a JSON document and validate them.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    ///
    /// Recognized variables (as written by the provisioning scripts):
    /// `M2M_CLIENT_ID`, `M2M_CLIENT_SECRET`, `TOKEN_ENDPOINT`,
    /// `COGNITO_DISCOVERY_URL`, `GATEWAY_URL`, `GATEWAY_SCOPE`,
    /// `IDENTITY_PROVIDER_NAME`, `WORKLOAD_USER_ID`, `GATEWAY_ALLOWED_CLIENTS`,
    /// `GATEWAY_AUDIENCES`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));
        let list = |key: &str| -> Vec<String> {
            get(key)
                .map(|v| {
                    v.split([',', ' '])
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let client_id = require("M2M_CLIENT_ID")?;
        let discovery_url = get("COGNITO_DISCOVERY_URL");
        let provider = ProviderSettings {
            client_id: client_id.clone(),
            client_secret: SecretString::from(require("M2M_CLIENT_SECRET")?),
            token_endpoint: get("TOKEN_ENDPOINT"),
            discovery_url: discovery_url.clone(),
            auth_method: ClientAuthMethod::default(),
        };
        let provider_name =
            get("IDENTITY_PROVIDER_NAME").unwrap_or_else(|| DEFAULT_PROVIDER_NAME.to_string());

        let mut allowed_clients = list("GATEWAY_ALLOWED_CLIENTS");
        let audiences = list("GATEWAY_AUDIENCES");
        if allowed_clients.is_empty() && audiences.is_empty() {
            allowed_clients.push(client_id);
        }

        let settings = Self {
            providers: BTreeMap::from([(provider_name.clone(), provider)]),
            workloads: vec![WorkloadSettings {
                workload_user_id: get("WORKLOAD_USER_ID")
                    .unwrap_or_else(|| DEFAULT_WORKLOAD_USER_ID.to_string()),
                provider: provider_name,
                resource_scope: get("GATEWAY_SCOPE").unwrap_or_default(),
            }],
            gateway: GatewaySettings {
                url: get("GATEWAY_URL"),
                discovery_url,
                audiences,
                allowed_clients,
                ..GatewaySettings::default()
            },
            ..Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-references and required values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, provider) in &self.providers {
            provider
                .credential("")
                .map_err(|e| ConfigError::Invalid(format!("provider '{name}': {e}")))?;
        }
        let mut seen = std::collections::HashSet::new();
        for workload in &self.workloads {
            if workload.workload_user_id.is_empty() {
                return Err(ConfigError::Invalid("empty workload_user_id".to_string()));
            }
            if !seen.insert(workload.workload_user_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate workload '{}'",
                    workload.workload_user_id
                )));
            }
            if !self.providers.contains_key(&workload.provider) {
                return Err(ConfigError::Invalid(format!(
                    "workload '{}' references unknown provider '{}'",
                    workload.workload_user_id, workload.provider
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".to_string()));
        }
        if self.gateway.algorithms.is_empty() {
            return Err(ConfigError::Invalid("gateway.algorithms must not be empty".to_string()));
        }
        Ok(())
    }

    /// Token broker options derived from the token and timeout sections.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions::default()
            .with_safety_margin(Duration::from_secs(self.token.safety_margin_secs))
            .with_exchange_timeout(self.timeouts.token_exchange())
    }

    /// Retry policy derived from the retry section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_backoff_multiplier(self.retry.backoff_multiplier)
            .with_jitter(self.retry.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"{
        "providers": {
            "gateway-m2m": {
                "client_id": "m2m-client",
                "client_secret": "s3cr3t",
                "discovery_url": "https://idp.example/.well-known/openid-configuration"
            }
        },
        "workloads": [
            { "workload_user_id": "agent-1", "provider": "gateway-m2m", "resource_scope": "orders:read" }
        ],
        "gateway": { "allowed_clients": ["m2m-client"], "algorithms": ["RS256", "ES256"] },
        "timeouts": { "backend_call_ms": 1500 },
        "retry": { "max_attempts": 5 }
    }"#;

    #[test]
    fn parses_json_with_defaults() {
        let settings = Settings::from_json_str(SAMPLE).unwrap();
        assert_eq!(settings.workloads[0].resource_scope, "orders:read");
        assert_eq!(settings.timeouts.backend_call(), Duration::from_millis(1500));
        assert_eq!(settings.timeouts.token_exchange(), Duration::from_secs(10));
        assert_eq!(settings.token.safety_margin_secs, 60);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.gateway.algorithms, vec![Algorithm::RS256, Algorithm::ES256]);
        assert_eq!(settings.gateway.jwks_min_refetch_secs, 5);
        let provider = &settings.providers["gateway-m2m"];
        assert_eq!(provider.client_secret.expose_secret(), "s3cr3t");
        let cred = provider.credential("orders:read").unwrap();
        assert_eq!(
            cred.token_endpoint,
            TokenEndpoint::Discovery("https://idp.example/.well-known/openid-configuration".into())
        );
    }

    #[test]
    fn rejects_workload_with_unknown_provider() {
        let json = r#"{
            "providers": {},
            "workloads": [{ "workload_user_id": "agent-1", "provider": "missing" }]
        }"#;
        let err = Settings::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("missing")));
    }

    #[test]
    fn rejects_provider_without_endpoint() {
        let json = r#"{
            "providers": { "p": { "client_id": "c", "client_secret": "s" } }
        }"#;
        assert!(Settings::from_json_str(json).is_err());
    }

    #[test]
    fn from_env_uses_provisioning_variable_names() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("M2M_CLIENT_ID", "client-abc"),
            ("M2M_CLIENT_SECRET", "secret-xyz"),
            ("COGNITO_DISCOVERY_URL", "https://idp.example/pool/.well-known/openid-configuration"),
            ("GATEWAY_URL", "https://gateway.example/mcp"),
            ("GATEWAY_SCOPE", "agentcore-gateway/read agentcore-gateway/write"),
        ]);
        let settings = Settings::from_env_with(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert!(settings.providers.contains_key(DEFAULT_PROVIDER_NAME));
        let workload = &settings.workloads[0];
        assert_eq!(workload.workload_user_id, DEFAULT_WORKLOAD_USER_ID);
        assert_eq!(workload.resource_scope, "agentcore-gateway/read agentcore-gateway/write");
        assert_eq!(settings.gateway.allowed_clients, vec!["client-abc".to_string()]);
        assert_eq!(settings.gateway.url.as_deref(), Some("https://gateway.example/mcp"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.workloads.len(), 1);

        let err = Settings::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(msg) if msg.contains("absent.json")));
    }

    #[test]
    fn from_env_requires_client_secret() {
        let err = Settings::from_env_with(|k| (k == "M2M_CLIENT_ID").then(|| "c".to_string()))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("M2M_CLIENT_SECRET".to_string()));
    }
}
