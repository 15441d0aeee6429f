//! Model Context Protocol surface over JSON-RPC 2.0.
//!
//! The gateway speaks the request/response subset of MCP's streamable HTTP
//! transport: `initialize`, `ping`, `tools/list` and `tools/call`. Every HTTP
//! request carries its own bearer token, so no session state is kept; the
//! `notifications/initialized` handshake is accepted and ignored.
//!
//! Tool outcomes map onto `CallToolResult`: a success carries the payload as
//! `structuredContent` plus a JSON text block, a dispatch failure sets
//! `isError` and carries `{kind, message}`. JSON-RPC errors are reserved for
//! protocol problems.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::DispatchErrorKind;
use crate::gateway::Claims;
use crate::tools::{
    AuthenticatedRequest, ToolDispatcher, ToolInvocationRequest, ToolInvocationResult, ToolSpec,
};
use crate::utils::CancelHandle;

/// Protocol revision preferred by this server.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Revisions accepted from clients; anything else is answered with the latest.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION_LATEST, "2025-03-26"];

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request id; `null` ids are only used in error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

/// A request, or a notification when `id` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: JsonRpcId, code: i64, message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: detail.map(|detail| json!({ "detail": detail })),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl From<ToolSpec> for McpTool {
    fn from(spec: ToolSpec) -> Self {
        Self {
            name: spec.name,
            description: (!spec.description.is_empty()).then_some(spec.description),
            input_schema: spec.input_schema,
            output_schema: spec.output_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl From<ToolInvocationResult> for CallToolResult {
    fn from(result: ToolInvocationResult) -> Self {
        match result {
            ToolInvocationResult::Success { payload } => {
                let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
                Self {
                    content: vec![ContentBlock::Text { text }],
                    // structuredContent must be an object.
                    structured_content: payload.is_object().then_some(payload),
                    is_error: false,
                }
            }
            ToolInvocationResult::Failure { kind, message } => Self {
                content: vec![ContentBlock::Text {
                    text: format!("{kind}: {message}"),
                }],
                structured_content: Some(json!({ "kind": kind, "message": message })),
                is_error: true,
            },
        }
    }
}

impl CallToolResult {
    /// Recover the dispatch outcome from a tool result.
    ///
    /// Errors without a recognizable `{kind, message}` are treated as backend
    /// unavailability; successes without structured content fall back to the
    /// first text block, parsed as JSON when possible.
    pub fn into_outcome(self) -> ToolInvocationResult {
        let text = self.content.into_iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
        });

        if self.is_error {
            let structured = self.structured_content.as_ref();
            let kind = structured
                .and_then(|v| v.get("kind"))
                .and_then(Value::as_str)
                .and_then(DispatchErrorKind::parse);
            let message = structured
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(text)
                .unwrap_or_default();
            return match kind {
                Some(kind) => ToolInvocationResult::failure(kind, message),
                None => ToolInvocationResult::failure(
                    DispatchErrorKind::BackendUnavailable,
                    format!("tool error without a kind: {message}"),
                ),
            };
        }

        let payload = match (self.structured_content, text) {
            (Some(structured), _) => structured,
            (None, Some(text)) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            (None, None) => Value::Null,
        };
        ToolInvocationResult::success(payload)
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn negotiate(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(PROTOCOL_VERSION_LATEST)
}

fn to_result<T: Serialize>(id: JsonRpcId, value: &T) -> JsonRpcResponse {
    match serde_json::to_value(value) {
        Ok(result) => JsonRpcResponse::ok(id, result),
        Err(e) => JsonRpcResponse::err(id, INTERNAL_ERROR, "internal error", Some(e.to_string())),
    }
}

/// Answer one message from an authenticated caller.
///
/// Returns `None` for notifications, which get no response body.
pub async fn respond(
    dispatcher: &ToolDispatcher,
    claims: Claims,
    request: JsonRpcRequest,
    cancel: &CancelHandle,
) -> Option<JsonRpcResponse> {
    let Some(id) = request.id else {
        tracing::debug!(method = %request.method, "mcp notification");
        return None;
    };
    if request.jsonrpc != "2.0" {
        return Some(JsonRpcResponse::err(id, INVALID_REQUEST, "invalid jsonrpc version", None));
    }

    let response = match request.method.as_str() {
        "initialize" => {
            let params = request
                .params
                .map(serde_json::from_value::<InitializeParams>)
                .transpose();
            match params {
                Ok(params) => {
                    let requested = params.as_ref().map(|p| p.protocol_version.as_str()).unwrap_or_default();
                    let result = InitializeResult {
                        protocol_version: negotiate(requested).to_string(),
                        capabilities: json!({ "tools": { "listChanged": false } }),
                        server_info: server_info(),
                    };
                    to_result(id, &result)
                }
                Err(e) => JsonRpcResponse::err(id, INVALID_PARAMS, "invalid params", Some(e.to_string())),
            }
        }
        "ping" => JsonRpcResponse::ok(id, json!({})),
        "tools/list" => {
            let result = ListToolsResult {
                tools: dispatcher.list_tools(&claims).into_iter().map(McpTool::from).collect(),
                next_cursor: None,
            };
            to_result(id, &result)
        }
        "tools/call" => {
            let params = request
                .params
                .ok_or_else(|| "missing params".to_string())
                .and_then(|v| serde_json::from_value::<CallToolParams>(v).map_err(|e| e.to_string()));
            match params {
                Ok(params) => {
                    let request = ToolInvocationRequest::new(
                        params.name,
                        params.arguments.unwrap_or_else(|| json!({})),
                    );
                    let result = dispatcher
                        .dispatch(AuthenticatedRequest { request, claims }, cancel)
                        .await;
                    to_result(id, &CallToolResult::from(result))
                }
                Err(detail) => JsonRpcResponse::err(id, INVALID_PARAMS, "invalid params", Some(detail)),
            }
        }
        other => {
            tracing::debug!(method = other, "unsupported mcp method");
            JsonRpcResponse::err(id, METHOD_NOT_FOUND, "method not found", None)
        }
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_notification_shapes() {
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})).unwrap();
        assert_eq!(req.id, Some(JsonRpcId::Number(7)));
        assert!(!req.is_notification());

        let note: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .unwrap();
        assert!(note.is_notification());

        let err = JsonRpcResponse::err(JsonRpcId::Null, PARSE_ERROR, "parse error", None);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse error"}})
        );
    }

    #[test]
    fn call_results_carry_the_dispatch_outcome() {
        let ok = CallToolResult::from(ToolInvocationResult::success(json!({"order_id": "123"})));
        assert!(!ok.is_error);
        assert_eq!(ok.structured_content, Some(json!({"order_id": "123"})));
        assert_eq!(
            serde_json::to_value(&ok).unwrap()["content"][0]["type"],
            json!("text")
        );
        assert_eq!(ok.into_outcome(), ToolInvocationResult::success(json!({"order_id": "123"})));

        let failed = CallToolResult::from(ToolInvocationResult::failure(
            DispatchErrorKind::BusinessError,
            "order not found",
        ));
        assert!(failed.is_error);
        assert_eq!(
            failed.content,
            vec![ContentBlock::Text {
                text: "business_error: order not found".to_string()
            }]
        );
        assert_eq!(
            failed.into_outcome(),
            ToolInvocationResult::failure(DispatchErrorKind::BusinessError, "order not found")
        );
    }

    #[test]
    fn foreign_results_are_interpreted_conservatively() {
        let scalar = CallToolResult::from(ToolInvocationResult::success(json!(42)));
        assert_eq!(scalar.structured_content, None);
        assert_eq!(scalar.into_outcome().payload(), Some(&json!(42)));

        let bare_error = CallToolResult {
            content: vec![ContentBlock::Text {
                text: "boom".to_string(),
            }],
            structured_content: None,
            is_error: true,
        };
        assert_eq!(
            bare_error.into_outcome().failure_kind(),
            Some(DispatchErrorKind::BackendUnavailable)
        );
    }

    #[test]
    fn protocol_version_negotiation() {
        assert_eq!(negotiate("2025-03-26"), "2025-03-26");
        assert_eq!(negotiate("1999-01-01"), PROTOCOL_VERSION_LATEST);
        assert_eq!(negotiate(""), PROTOCOL_VERSION_LATEST);
    }
}
