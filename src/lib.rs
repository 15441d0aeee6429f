//! # Toolgate - machine-to-machine auth and tool dispatch for agent runtimes
//!
#![deny(unsafe_code)]

//! Toolgate is the runtime core between an autonomous agent and the backend
//! tools it calls without a human present:
//!
//! - **Token brokering**: OAuth2 client-credentials tokens, cached and
//!   refreshed single-flight before expiry ([`auth::TokenBroker`]).
//! - **Workload identity**: workload ids mapped to credential providers and
//!   resource scopes ([`identity::IdentityContext`]).
//! - **Gateway**: bearer token validation against the identity provider's
//!   key set ([`gateway::GatewayAuthenticator`]) followed by schema-checked
//!   dispatch to registered tools ([`tools::ToolDispatcher`]), served over a
//!   REST route or MCP ([`gateway::mcp`]).
//! - **Orchestration**: tasks turned into tool calls with bounded retries of
//!   transient failures ([`orchestrator::RuntimeOrchestrator`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     let http = reqwest::Client::new();
//!
//!     let identities = Arc::new(IdentityContext::from_settings(&settings, http.clone())?);
//!     // GATEWAY_URL names the gateway's MCP endpoint.
//!     let gateway_url = settings.gateway.url.clone().unwrap_or_default();
//!     let transport = Arc::new(McpGatewayClient::new(http, gateway_url));
//!     let orchestrator = RuntimeOrchestrator::new(identities, transport)
//!         .with_retry_policy(settings.retry_policy());
//!
//!     let task = TaskRequest::new("test-user-123", "look up order 123").with_tool_call(
//!         ToolInvocationRequest::new("get_order", serde_json::json!({"order_id": "123"})),
//!     );
//!     let answer = orchestrator.handle(task).await?;
//!     println!("{}", answer.summary);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod orchestrator;
pub mod retry;
pub mod server_adapters;
pub mod telemetry;
pub mod tools;
pub mod utils;

/// Commonly used types.
pub mod prelude {
    pub use crate::auth::{
        BrokerOptions, ClientAuthMethod, Clock, Credential, ManualClock, SystemClock, Token,
        TokenBroker,
    };
    pub use crate::config::Settings;
    pub use crate::error::{
        AuthError, ConfigError, DispatchErrorKind, IdentityError, OrchestratorError,
    };
    pub use crate::gateway::{
        AuthenticatorConfig, Claims, Gateway, GatewayAuthenticator, KeySource, ProtocolEnvelope,
    };
    pub use crate::identity::{IdentityContext, WorkloadIdentity};
    pub use crate::orchestrator::{
        DirectPlanner, FinalAnswer, GatewayTransport, HttpGatewayClient, InProcessTransport,
        McpGatewayClient, Planner, RuntimeOrchestrator, TaskRequest, ToolOutcome,
    };
    pub use crate::retry::{RetryExecutor, RetryPolicy};
    pub use crate::tools::{
        AuthenticatedRequest, ToolDispatcher, ToolError, ToolHandler, ToolInvocationRequest,
        ToolInvocationResult, ToolRegistry, ToolSpec,
    };
    pub use crate::utils::CancelHandle;
}
