//! Gateway: the trust boundary in front of the tools.
//!
//! A [`Gateway`] authenticates the bearer token, then hands the request and
//! its claims to the [`ToolDispatcher`]. Results travel back to callers in a
//! [`ProtocolEnvelope`], or as MCP tool results through [`mcp`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Settings;
use crate::error::{AuthError, ConfigError, DispatchErrorKind};
use crate::tools::{
    AuthenticatedRequest, ToolDispatcher, ToolInvocationRequest, ToolInvocationResult, ToolRegistry,
    ToolSpec,
};
use crate::utils::CancelHandle;

pub mod authenticator;
pub mod mcp;

pub use authenticator::{AuthenticatorConfig, Claims, GatewayAuthenticator, KeySource, bearer_from_header};

/// Body of an `{"error": ...}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub kind: String,
    pub message: String,
}

/// Wire shape returned by the gateway: `{"result": ...}` or `{"error": {kind, message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEnvelope {
    Result(Value),
    Error(EnvelopeError),
}

impl ProtocolEnvelope {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(EnvelopeError {
            kind: kind.into(),
            message: message.into(),
        })
    }

    /// Recover the outcome carried by an envelope.
    ///
    /// Dispatch kinds become tool results, authentication kinds become
    /// errors. Unrecognized kinds are treated as backend unavailability.
    pub fn into_outcome(self) -> Result<ToolInvocationResult, AuthError> {
        match self {
            Self::Result(payload) => Ok(ToolInvocationResult::success(payload)),
            Self::Error(EnvelopeError { kind, message }) => {
                if let Some(kind) = DispatchErrorKind::parse(&kind) {
                    return Ok(ToolInvocationResult::failure(kind, message));
                }
                if let Some(err) = AuthError::from_kind(&kind, message.clone()) {
                    return Err(err);
                }
                Ok(ToolInvocationResult::failure(
                    DispatchErrorKind::BackendUnavailable,
                    format!("unrecognized error kind {kind}: {message}"),
                ))
            }
        }
    }
}

impl From<ToolInvocationResult> for ProtocolEnvelope {
    fn from(result: ToolInvocationResult) -> Self {
        match result {
            ToolInvocationResult::Success { payload } => Self::Result(payload),
            ToolInvocationResult::Failure { kind, message } => Self::error(kind.as_str(), message),
        }
    }
}

impl From<&AuthError> for ProtocolEnvelope {
    fn from(err: &AuthError) -> Self {
        Self::error(err.kind(), err.message())
    }
}

/// Authenticator plus dispatcher.
#[derive(Debug, Clone)]
pub struct Gateway {
    authenticator: Arc<GatewayAuthenticator>,
    dispatcher: ToolDispatcher,
}

impl Gateway {
    pub fn new(authenticator: GatewayAuthenticator, dispatcher: ToolDispatcher) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            dispatcher,
        }
    }

    /// Build a gateway from settings over the given tool registry.
    pub fn from_settings(
        settings: &Settings,
        registry: ToolRegistry,
        http: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let config = AuthenticatorConfig::from_settings(&settings.gateway, &settings.timeouts)?;
        let authenticator = GatewayAuthenticator::new(config, http)?;
        let dispatcher =
            ToolDispatcher::new(registry).with_backend_timeout(settings.timeouts.backend_call());
        Ok(Self::new(authenticator, dispatcher))
    }

    pub fn authenticator(&self) -> &GatewayAuthenticator {
        &self.authenticator
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Authenticate `bearer` and dispatch the request.
    ///
    /// Authentication failures are returned as errors and never reach the
    /// dispatcher; every dispatch outcome is a [`ToolInvocationResult`].
    pub async fn handle(
        &self,
        bearer: &str,
        request: ToolInvocationRequest,
        cancel: &CancelHandle,
    ) -> Result<ToolInvocationResult, AuthError> {
        let claims = self.authenticator.authenticate(bearer).await?;
        Ok(self
            .dispatcher
            .dispatch(AuthenticatedRequest { request, claims }, cancel)
            .await)
    }

    /// Tools the bearer's scopes allow.
    pub async fn list_tools(&self, bearer: &str) -> Result<Vec<ToolSpec>, AuthError> {
        let claims = self.authenticator.authenticate(bearer).await?;
        Ok(self.dispatcher.list_tools(&claims))
    }
}
