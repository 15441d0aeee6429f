//! Error Handling Module
//!
//! Error taxonomy for the authentication-and-dispatch core:
//! - `AuthError`: token exchange and inbound token validation
//! - `IdentityError`: workload identity resolution
//! - `DispatchErrorKind`: structured tool failure kinds carried in results
//! - `ConfigError`: invalid or incomplete configuration
//! - `OrchestratorError`: terminal failures surfaced by the runtime orchestrator
//!
//! None of these carry credential material. Messages name identifiers
//! (workload ids, tool names, endpoints) but never tokens or secrets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication failures, both outbound (token exchange) and inbound (gateway validation).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The client-credentials exchange failed (network, timeout, non-2xx, malformed body).
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Bad signature, wrong issuer/audience/client, or a malformed token.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token's expiry has passed.
    #[error("Expired token: {0}")]
    ExpiredToken(String),

    /// The identity provider's key set could not be fetched in time.
    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),
}

impl AuthError {
    /// Stable kind tag used in protocol envelopes and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TokenExchangeFailed(_) => "token_exchange_failed",
            Self::InvalidToken(_) => "invalid_token",
            Self::ExpiredToken(_) => "expired_token",
            Self::KeySetUnavailable(_) => "key_set_unavailable",
        }
    }

    /// The detail message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::TokenExchangeFailed(m)
            | Self::InvalidToken(m)
            | Self::ExpiredToken(m)
            | Self::KeySetUnavailable(m) => m,
        }
    }

    /// Whether the error must be reported to an HTTP caller as 401.
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::InvalidToken(_) | Self::ExpiredToken(_))
    }

    /// Rebuild an inbound validation error from its envelope kind tag.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match kind {
            "token_exchange_failed" => Some(Self::TokenExchangeFailed(message)),
            "invalid_token" => Some(Self::InvalidToken(message)),
            "expired_token" => Some(Self::ExpiredToken(message)),
            "key_set_unavailable" => Some(Self::KeySetUnavailable(message)),
            _ => None,
        }
    }
}

/// Workload identity resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No configuration exists for the workload identifier.
    ///
    /// This is the root cause of "workload access token has not been set"
    /// failures: the caller must register the workload before requesting tokens.
    #[error(
        "Unknown workload '{workload_user_id}': no identity is registered for this workload; \
         register it (workload user id + resource scope) before requesting an access token"
    )]
    UnknownWorkload { workload_user_id: String },

    /// The context was shut down and no longer hands out brokers.
    #[error("Identity context has been shut down")]
    ContextClosed,
}

impl IdentityError {
    /// Stable kind tag used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownWorkload { .. } => "unknown_workload",
            Self::ContextClosed => "context_closed",
        }
    }
}

/// Structured failure kinds carried by `ToolInvocationResult::Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    /// No backend is registered under the requested tool name.
    UnknownTool,
    /// Arguments do not satisfy the tool's declared input schema.
    InvalidArguments,
    /// The backend reported a domain-level error (e.g. "order not found").
    BusinessError,
    /// Backend timeout, internal fault, or malformed response.
    BackendUnavailable,
    /// The caller's granted scopes do not allow this tool.
    Forbidden,
    /// The request was cancelled before the backend was invoked.
    Cancelled,
}

impl DispatchErrorKind {
    /// Stable kind tag, identical to the serialized form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::BusinessError => "business_error",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Forbidden => "forbidden",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a kind tag produced by [`DispatchErrorKind::as_str`].
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "unknown_tool" => Some(Self::UnknownTool),
            "invalid_arguments" => Some(Self::InvalidArguments),
            "business_error" => Some(Self::BusinessError),
            "backend_unavailable" => Some(Self::BackendUnavailable),
            "forbidden" => Some(Self::Forbidden),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Only transient backend unavailability may be retried; retrying any
    /// other kind cannot change the outcome.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable)
    }
}

impl std::fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid or incomplete configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Terminal failures of a runtime orchestrator request.
///
/// Tool-level failures are not errors here: they are folded into the
/// final answer as structured outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Planning failed: {0}")]
    Planning(String),
}

impl OrchestratorError {
    /// Stable kind tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identity(e) => e.kind(),
            Self::Auth(e) => e.kind(),
            Self::Planning(_) => "planning_failed",
        }
    }
}
