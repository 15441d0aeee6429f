//! Tool model and registration.
//!
//! A tool is a named, schema-described backend capability. Backends implement
//! [`ToolHandler`]; the [`ToolRegistry`] maps names to handlers and the
//! [`ToolDispatcher`] turns authenticated requests into structured results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::DispatchErrorKind;
use crate::gateway::Claims;

pub mod dispatcher;
pub mod orders;
pub mod registry;

pub use dispatcher::{TARGET_DELIMITER, ToolDispatcher, strip_target_prefix};
pub use orders::{OrderStore, register_order_tools};
pub use registry::{RegistryError, ToolRegistry};

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A normalized tool invocation: tool name plus structured arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

impl ToolInvocationRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Outcome of a dispatch: either a payload or a structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolInvocationResult {
    Success { payload: Value },
    Failure { kind: DispatchErrorKind, message: String },
}

impl ToolInvocationResult {
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    pub fn failure(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure kind, if this is a failure.
    pub fn failure_kind(&self) -> Option<DispatchErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Success { payload } => Some(payload),
            Self::Failure { .. } => None,
        }
    }
}

/// A request whose bearer token has been validated.
///
/// Only exists between authentication and dispatch.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    pub request: ToolInvocationRequest,
    pub claims: Claims,
}

/// Descriptor of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Any one of these scopes allows invocation; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            required_scopes: Vec::new(),
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_required_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the granted claims allow invoking this tool.
    pub fn permits(&self, claims: &Claims) -> bool {
        self.required_scopes.is_empty() || claims.has_any_scope(&self.required_scopes)
    }
}

/// Errors a backend may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// A domain-level outcome the caller should see, e.g. "order not found".
    #[error("{0}")]
    Business(String),

    /// An unexpected fault inside the backend.
    #[error("backend fault: {0}")]
    Fault(String),
}

/// A backend capability invocable by name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Descriptor used for registration and listing.
    fn spec(&self) -> ToolSpec;

    /// Invoke the backend with schema-validated arguments.
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError>;
}
