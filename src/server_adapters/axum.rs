//! Axum-specific server adapters
//!
//! Routes:
//! - `POST /tools/invoke`: `Authorization: Bearer <token>`, body `{tool_name, arguments}`
//! - `GET /tools`: tools the caller's scopes allow
//! - `POST /mcp`: MCP JSON-RPC (`initialize`, `tools/list`, `tools/call`), bearer required
//! - `GET /health`
//!
//! Every tool outcome is a 200 carrying a protocol envelope. Authentication
//! failures are 401 with a `WWW-Authenticate` challenge; key-set outages are 503.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::error::{AuthError, DispatchErrorKind};
use crate::gateway::mcp::{self, INVALID_REQUEST, JsonRpcId, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crate::gateway::{Gateway, ProtocolEnvelope, bearer_from_header};
use crate::server_adapters::{ResponseOptions, auth_envelope, auth_status, www_authenticate};
use crate::tools::{ToolInvocationRequest, ToolInvocationResult};
use crate::utils::CancelHandle;

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    opts: ResponseOptions,
}

/// Build the gateway router.
pub fn router(gateway: Arc<Gateway>, opts: ResponseOptions) -> Router {
    Router::new()
        .route("/tools/invoke", post(invoke))
        .route("/tools", get(list_tools))
        .route("/mcp", post(mcp_message))
        .route("/health", get(health))
        .with_state(AppState { gateway, opts })
}

fn auth_failure(err: &AuthError, opts: &ResponseOptions) -> Response {
    let status = StatusCode::from_u16(auth_status(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(auth_envelope(err, opts))).into_response();
    if let Some(challenge) = www_authenticate(err)
        && let Ok(value) = HeaderValue::from_str(&challenge)
    {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthError::InvalidToken("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| AuthError::InvalidToken("malformed Authorization header".to_string()))?;
    bearer_from_header(value)
}

async fn invoke(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let token = match bearer(&headers) {
        Ok(token) => token,
        Err(err) => return auth_failure(&err, &state.opts),
    };
    let claims = match state.gateway.authenticator().authenticate(token).await {
        Ok(claims) => claims,
        Err(err) => return auth_failure(&err, &state.opts),
    };

    // Body is only inspected once the caller is authenticated.
    let request: ToolInvocationRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let envelope: ProtocolEnvelope = ToolInvocationResult::failure(
                DispatchErrorKind::InvalidArguments,
                format!("malformed request body: {e}"),
            )
            .into();
            return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
        }
    };

    let result = state
        .gateway
        .dispatcher()
        .dispatch(
            crate::tools::AuthenticatedRequest { request, claims },
            &CancelHandle::new(),
        )
        .await;
    (StatusCode::OK, Json(ProtocolEnvelope::from(result))).into_response()
}

async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match bearer(&headers) {
        Ok(token) => token,
        Err(err) => return auth_failure(&err, &state.opts),
    };
    match state.gateway.list_tools(token).await {
        Ok(tools) => {
            let envelope = ProtocolEnvelope::Result(json!({ "tools": tools }));
            (StatusCode::OK, Json(envelope)).into_response()
        }
        Err(err) => auth_failure(&err, &state.opts),
    }
}

fn jsonrpc_response(resp: JsonRpcResponse) -> Response {
    (StatusCode::OK, Json(resp)).into_response()
}

async fn mcp_message(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let token = match bearer(&headers) {
        Ok(token) => token,
        Err(err) => return auth_failure(&err, &state.opts),
    };
    let claims = match state.gateway.authenticator().authenticate(token).await {
        Ok(claims) => claims,
        Err(err) => return auth_failure(&err, &state.opts),
    };

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return jsonrpc_response(JsonRpcResponse::err(
                JsonRpcId::Null,
                PARSE_ERROR,
                "parse error",
                Some(e.to_string()),
            ));
        }
    };
    if value.is_array() {
        return jsonrpc_response(JsonRpcResponse::err(
            JsonRpcId::Null,
            INVALID_REQUEST,
            "batching not supported",
            None,
        ));
    }
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return jsonrpc_response(JsonRpcResponse::err(
                JsonRpcId::Null,
                INVALID_REQUEST,
                "invalid request",
                Some(e.to_string()),
            ));
        }
    };

    match mcp::respond(state.gateway.dispatcher(), claims, request, &CancelHandle::new()).await {
        Some(resp) => jsonrpc_response(resp),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
