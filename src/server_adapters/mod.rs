//! Server adapters: render gateway outcomes as HTTP responses
//!
//! Framework-agnostic helpers decide status codes, challenge headers and
//! error masking; [`axum`] wires them into a router (requires the `server`
//! feature).
//!
//! ## Example (Axum)
//!
//! ```rust,no_run
//! # #[cfg(feature = "server")]
//! # async fn serve(gateway: toolgate::gateway::Gateway) -> std::io::Result<()> {
//! use std::sync::Arc;
//! use toolgate::server_adapters::{ResponseOptions, axum::router};
//!
//! let app = router(Arc::new(gateway), ResponseOptions::production());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await
//! # }
//! ```

use crate::error::AuthError;
use crate::gateway::ProtocolEnvelope;

#[cfg(feature = "server")]
pub mod axum;

/// Options controlling how errors are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOptions {
    /// Replace authentication failure details with a generic message.
    pub mask_errors: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self::production()
    }
}

impl ResponseOptions {
    /// Full error details.
    pub fn development() -> Self {
        Self { mask_errors: false }
    }

    /// Authentication failures only reveal their kind.
    pub fn production() -> Self {
        Self { mask_errors: true }
    }
}

/// HTTP status for an authentication failure.
pub fn auth_status(err: &AuthError) -> u16 {
    match err {
        AuthError::InvalidToken(_) | AuthError::ExpiredToken(_) => 401,
        AuthError::KeySetUnavailable(_) => 503,
        AuthError::TokenExchangeFailed(_) => 500,
    }
}

/// `WWW-Authenticate` challenge for 401 responses.
pub fn www_authenticate(err: &AuthError) -> Option<String> {
    err.is_unauthorized().then(|| {
        let description = match err {
            AuthError::ExpiredToken(_) => "the access token expired",
            _ => "the access token is invalid",
        };
        format!("Bearer error=\"invalid_token\", error_description=\"{description}\"")
    })
}

/// Envelope for an authentication failure, masked if requested.
pub fn auth_envelope(err: &AuthError, opts: &ResponseOptions) -> ProtocolEnvelope {
    if opts.mask_errors {
        let message = match err {
            AuthError::ExpiredToken(_) => "token expired",
            AuthError::InvalidToken(_) => "token rejected",
            AuthError::KeySetUnavailable(_) => "authentication temporarily unavailable",
            AuthError::TokenExchangeFailed(_) => "authentication failed",
        };
        ProtocolEnvelope::error(err.kind(), message)
    } else {
        ProtocolEnvelope::from(err)
    }
}
