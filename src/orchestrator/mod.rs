//! Runtime orchestrator
//!
//! The agent-facing entry point. A task is turned into tool invocations by a
//! [`Planner`]; each invocation is sent through a [`GatewayTransport`] with a
//! token from the workload's broker. Transient backend failures are retried
//! under the configured [`RetryPolicy`]; every other tool outcome is folded
//! into the [`FinalAnswer`] as-is. Identity and authentication failures end
//! the task immediately, except a gateway that cannot reach its key set,
//! which counts as an unavailable backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::TokenBroker;
use crate::error::{AuthError, DispatchErrorKind, OrchestratorError};
use crate::identity::IdentityContext;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::tools::{ToolInvocationRequest, ToolInvocationResult};

pub mod transport;

pub use transport::{GatewayTransport, HttpGatewayClient, InProcessTransport, McpGatewayClient};

/// A unit of work from the agent's caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub workload_user_id: String,
    #[serde(default)]
    pub prompt: String,
    /// Invocations already decided by the caller (used by [`DirectPlanner`]).
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocationRequest>,
}

impl TaskRequest {
    pub fn new(workload_user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            workload_user_id: workload_user_id.into(),
            prompt: prompt.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolInvocationRequest) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Decides which tools a task needs.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &TaskRequest) -> Result<Vec<ToolInvocationRequest>, OrchestratorError>;
}

/// Executes exactly the invocations carried by the task.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectPlanner;

#[async_trait]
impl Planner for DirectPlanner {
    async fn plan(&self, task: &TaskRequest) -> Result<Vec<ToolInvocationRequest>, OrchestratorError> {
        Ok(task.tool_calls.clone())
    }
}

/// Result of one planned invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub result: ToolInvocationResult,
    pub attempts: u32,
}

/// What the orchestrator returns to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalAnswer {
    pub outcomes: Vec<ToolOutcome>,
    pub summary: String,
}

impl FinalAnswer {
    fn from_outcomes(outcomes: Vec<ToolOutcome>) -> Self {
        let summary = if outcomes.is_empty() {
            "no tool calls were needed".to_string()
        } else {
            outcomes
                .iter()
                .map(|o| match &o.result {
                    ToolInvocationResult::Success { .. } => format!("{}: ok", o.tool_name),
                    ToolInvocationResult::Failure { kind, message } => {
                        format!("{}: {kind}: {message}", o.tool_name)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        Self { outcomes, summary }
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_success())
    }
}

/// Orchestrator options.
#[derive(Clone)]
pub struct OrchestratorOptions {
    /// Maximum invocations a single task may plan.
    pub max_calls: usize,
    /// Called after each invocation settles.
    pub on_outcome: Option<Arc<dyn Fn(&ToolOutcome) + Send + Sync>>,
    /// Called with the final answer.
    pub on_finish: Option<Arc<dyn Fn(&FinalAnswer) + Send + Sync>>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_calls: 8,
            on_outcome: None,
            on_finish: None,
        }
    }
}

impl std::fmt::Debug for OrchestratorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorOptions")
            .field("max_calls", &self.max_calls)
            .field("on_outcome", &self.on_outcome.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

pub struct RuntimeOrchestrator {
    identities: Arc<IdentityContext>,
    transport: Arc<dyn GatewayTransport>,
    planner: Arc<dyn Planner>,
    retry: RetryExecutor,
    options: OrchestratorOptions,
}

impl RuntimeOrchestrator {
    /// Orchestrator with the [`DirectPlanner`] and the default retry policy.
    pub fn new(identities: Arc<IdentityContext>, transport: Arc<dyn GatewayTransport>) -> Self {
        Self {
            identities,
            transport,
            planner: Arc::new(DirectPlanner),
            retry: RetryExecutor::new(RetryPolicy::default()),
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identities(&self) -> &IdentityContext {
        &self.identities
    }

    pub async fn handle(&self, task: TaskRequest) -> Result<FinalAnswer, OrchestratorError> {
        let request_id = uuid::Uuid::new_v4();
        let workload = task.workload_user_id.as_str();

        let broker = self.identities.resolve(workload).inspect_err(|err| {
            tracing::warn!(%request_id, workload_user_id = workload, error.kind = err.kind(), "workload resolution failed");
        })?;

        let calls = self.planner.plan(&task).await?;
        if calls.len() > self.options.max_calls {
            return Err(OrchestratorError::Planning(format!(
                "plan has {} tool calls; at most {} are allowed",
                calls.len(),
                self.options.max_calls
            )));
        }
        tracing::debug!(%request_id, workload_user_id = workload, calls = calls.len(), "task planned");

        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            let tool_name = call.tool_name.clone();
            let attempted = self
                .retry
                .execute(|_| self.attempt(broker.clone(), call.clone()))
                .await
                .inspect_err(|err| {
                    tracing::warn!(
                        %request_id,
                        workload_user_id = workload,
                        tool = %tool_name,
                        error.kind = err.kind(),
                        "task aborted"
                    );
                })?;

            let outcome = ToolOutcome {
                tool_name,
                result: attempted.value,
                attempts: attempted.attempts,
            };
            if let Some(cb) = &self.options.on_outcome {
                cb(&outcome);
            }
            outcomes.push(outcome);
        }

        let answer = FinalAnswer::from_outcomes(outcomes);
        tracing::debug!(
            %request_id,
            workload_user_id = workload,
            succeeded = answer.all_succeeded(),
            "task finished"
        );
        if let Some(cb) = &self.options.on_finish {
            cb(&answer);
        }
        Ok(answer)
    }

    /// One gateway round trip with a freshly obtained token.
    async fn attempt(
        &self,
        broker: TokenBroker,
        call: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, OrchestratorError> {
        let token = broker.get_token().await?;
        match self.transport.invoke(&token, call).await {
            Ok(result) => Ok(result),
            // The token is fine; the gateway could not reach its key set.
            Err(AuthError::KeySetUnavailable(message)) => Ok(ToolInvocationResult::failure(
                DispatchErrorKind::BackendUnavailable,
                format!("gateway could not verify the token: {message}"),
            )),
            Err(err) => {
                if err.is_unauthorized() {
                    // The gateway will not accept this token again.
                    broker.invalidate();
                }
                Err(OrchestratorError::Auth(err))
            }
        }
    }
}
