//! Tool dispatcher
//!
//! Routes an [`AuthenticatedRequest`] to its backend and normalizes the
//! outcome. Checks run in a fixed order and each one short-circuits before
//! the backend is touched: name lookup, scope authorization, argument
//! schema, cancellation. The backend call itself runs on a detached task;
//! once issued it is never rolled back, even if the caller stops waiting.

use std::sync::Arc;
use std::time::Duration;

use super::registry::RegisteredTool;
use super::{AuthenticatedRequest, ToolError, ToolInvocationResult, ToolRegistry, ToolSpec};
use crate::error::DispatchErrorKind;
use crate::gateway::Claims;
use crate::utils::CancelHandle;

/// Separator between a gateway target name and a tool name.
pub const TARGET_DELIMITER: &str = "___";

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Drop a `<target>___` prefix, if present.
pub fn strip_target_prefix(tool_name: &str) -> &str {
    tool_name
        .split_once(TARGET_DELIMITER)
        .map_or(tool_name, |(_, tool)| tool)
}

#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    backend_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    /// Budget for a single backend call.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Tools the caller's scopes allow.
    pub fn list_tools(&self, claims: &Claims) -> Vec<ToolSpec> {
        self.registry
            .specs()
            .into_iter()
            .filter(|spec| spec.permits(claims))
            .collect()
    }

    pub async fn dispatch(
        &self,
        request: AuthenticatedRequest,
        cancel: &CancelHandle,
    ) -> ToolInvocationResult {
        let AuthenticatedRequest { request, claims } = request;
        let tool_name = strip_target_prefix(&request.tool_name).to_string();

        let result = match self.registry.get(&tool_name) {
            None => ToolInvocationResult::failure(
                DispatchErrorKind::UnknownTool,
                format!("unknown tool: {tool_name}"),
            ),
            Some(tool) => self.run(tool, request.arguments, &claims, cancel).await,
        };

        match &result {
            ToolInvocationResult::Success { .. } => {
                tracing::debug!(tool = %tool_name, subject = %claims.subject, "tool invocation succeeded");
            }
            ToolInvocationResult::Failure { kind, .. } => {
                tracing::debug!(
                    tool = %tool_name,
                    subject = %claims.subject,
                    error.kind = kind.as_str(),
                    "tool invocation failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        tool: Arc<RegisteredTool>,
        arguments: serde_json::Value,
        claims: &Claims,
        cancel: &CancelHandle,
    ) -> ToolInvocationResult {
        let name = &tool.spec.name;

        if !tool.spec.permits(claims) {
            return ToolInvocationResult::failure(
                DispatchErrorKind::Forbidden,
                format!(
                    "tool {name} requires one of scopes [{}]",
                    tool.spec.required_scopes.join(", ")
                ),
            );
        }

        if let Err(violations) = tool.validate_input(&arguments) {
            return ToolInvocationResult::failure(
                DispatchErrorKind::InvalidArguments,
                format!("invalid arguments for {name}: {violations}"),
            );
        }

        if cancel.is_cancelled() {
            return ToolInvocationResult::failure(
                DispatchErrorKind::Cancelled,
                format!("invocation of {name} cancelled before dispatch"),
            );
        }

        let handler = Arc::clone(&tool.handler);
        let call = tokio::spawn(async move { handler.invoke(arguments).await });

        let outcome = match tokio::time::timeout(self.backend_timeout, call).await {
            Err(_) => {
                return ToolInvocationResult::failure(
                    DispatchErrorKind::BackendUnavailable,
                    format!(
                        "backend for {name} timed out after {}ms",
                        self.backend_timeout.as_millis()
                    ),
                );
            }
            Ok(Err(join_err)) => {
                return ToolInvocationResult::failure(
                    DispatchErrorKind::BackendUnavailable,
                    format!("backend for {name} crashed: {join_err}"),
                );
            }
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            Ok(payload) => match tool.validate_output(&payload) {
                Ok(()) => ToolInvocationResult::success(payload),
                Err(violations) => ToolInvocationResult::failure(
                    DispatchErrorKind::BackendUnavailable,
                    format!("malformed response from {name}: {violations}"),
                ),
            },
            Err(ToolError::Business(message)) => {
                ToolInvocationResult::failure(DispatchErrorKind::BusinessError, message)
            }
            Err(err @ ToolError::Fault(_)) => {
                ToolInvocationResult::failure(DispatchErrorKind::BackendUnavailable, err.to_string())
            }
        }
    }
}
