//! Transports from the orchestrator to a gateway.
//!
//! [`InProcessTransport`] calls a [`Gateway`] directly; [`HttpGatewayClient`]
//! talks to a remote gateway's REST route and [`McpGatewayClient`] to its MCP
//! endpoint. All present the same contract: authentication failures are
//! errors, every other outcome (including transport faults) is a
//! [`ToolInvocationResult`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::auth::Token;
use crate::error::{AuthError, DispatchErrorKind};
use crate::gateway::mcp::{
    CallToolParams, CallToolResult, INVALID_PARAMS, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION_LATEST,
};
use crate::gateway::{Gateway, ProtocolEnvelope};
use crate::tools::{ToolInvocationRequest, ToolInvocationResult};
use crate::utils::CancelHandle;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends authenticated tool invocations to a gateway.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn invoke(
        &self,
        token: &Token,
        request: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, AuthError>;
}

/// Calls an in-process [`Gateway`].
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    gateway: Arc<Gateway>,
}

impl InProcessTransport {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl GatewayTransport for InProcessTransport {
    async fn invoke(
        &self,
        token: &Token,
        request: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, AuthError> {
        self.gateway
            .handle(token.access_token().expose_secret(), request, &CancelHandle::new())
            .await
    }
}

/// HTTP client for a remote gateway.
#[derive(Debug, Clone)]
pub struct HttpGatewayClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpGatewayClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Budget for one gateway round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn unavailable(message: String) -> ToolInvocationResult {
    ToolInvocationResult::failure(DispatchErrorKind::BackendUnavailable, message)
}

/// Send one request and read the whole body. Transport faults come back as
/// a ready-made unavailable result.
async fn round_trip(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<(reqwest::StatusCode, Vec<u8>), ToolInvocationResult> {
    let resp = match request.timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => {
            return Err(unavailable(format!(
                "gateway request timed out after {}ms",
                timeout.as_millis()
            )));
        }
        Err(e) => {
            return Err(unavailable(format!(
                "gateway request failed: {}",
                e.without_url()
            )));
        }
    };

    let status = resp.status();
    match resp.bytes().await {
        Ok(body) => Ok((status, body.to_vec())),
        Err(e) => Err(unavailable(format!(
            "gateway response interrupted: {}",
            e.without_url()
        ))),
    }
}

/// Interpret a protocol envelope body; a bare 401 still means the token was refused.
fn from_envelope(status: reqwest::StatusCode, body: &[u8]) -> Result<ToolInvocationResult, AuthError> {
    match serde_json::from_slice::<ProtocolEnvelope>(body) {
        Ok(envelope) => envelope.into_outcome(),
        Err(_) if status == reqwest::StatusCode::UNAUTHORIZED => Err(AuthError::InvalidToken(
            "gateway rejected the token".to_string(),
        )),
        Err(_) => Ok(unavailable(format!(
            "gateway returned http={} without a protocol envelope",
            status.as_u16()
        ))),
    }
}

#[async_trait]
impl GatewayTransport for HttpGatewayClient {
    async fn invoke(
        &self,
        token: &Token,
        request: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, AuthError> {
        let sent = self
            .http
            .post(format!("{}/tools/invoke", self.base_url))
            .bearer_auth(token.access_token().expose_secret())
            .json(&request);
        match round_trip(sent, self.timeout).await {
            Ok((status, body)) => from_envelope(status, &body),
            Err(failure) => Ok(failure),
        }
    }
}

/// MCP client for a remote gateway's `/mcp` endpoint.
///
/// Each invocation is a single stateless `tools/call` request; the gateway
/// authenticates every request by its bearer token, so no session is opened.
#[derive(Debug)]
pub struct McpGatewayClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    next_id: AtomicI64,
}

impl McpGatewayClient {
    /// `endpoint` is the full MCP URL, e.g. `https://gateway.example/mcp`.
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn outcome(response: JsonRpcResponse) -> ToolInvocationResult {
        if let Some(error) = response.error {
            let kind = if error.code == INVALID_PARAMS {
                DispatchErrorKind::InvalidArguments
            } else {
                DispatchErrorKind::BackendUnavailable
            };
            return ToolInvocationResult::failure(
                kind,
                format!("mcp error {}: {}", error.code, error.message),
            );
        }
        match response.result.map(serde_json::from_value::<CallToolResult>) {
            Some(Ok(result)) => result.into_outcome(),
            Some(Err(e)) => unavailable(format!("malformed tool result: {e}")),
            None => unavailable("mcp response without a result".to_string()),
        }
    }
}

#[async_trait]
impl GatewayTransport for McpGatewayClient {
    async fn invoke(
        &self,
        token: &Token,
        request: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, AuthError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = CallToolParams {
            name: request.tool_name,
            arguments: Some(request.arguments),
        };
        let message = JsonRpcRequest::new(
            JsonRpcId::Number(id),
            "tools/call",
            serde_json::to_value(params).ok(),
        );
        let sent = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token.access_token().expose_secret())
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .header("mcp-protocol-version", PROTOCOL_VERSION_LATEST)
            .json(&message);

        let (status, body) = match round_trip(sent, self.timeout).await {
            Ok(reply) => reply,
            Err(failure) => return Ok(failure),
        };
        if !status.is_success() {
            return from_envelope(status, &body);
        }
        match serde_json::from_slice::<JsonRpcResponse>(&body) {
            Ok(response) => Ok(Self::outcome(response)),
            Err(_) => Ok(unavailable(format!(
                "gateway returned http={} without a JSON-RPC response",
                status.as_u16()
            ))),
        }
    }
}
