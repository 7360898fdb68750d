//! OpenAI-compatible chat surface.
//!
//! Thin adapters over the same machinery the RPC surface uses: bearer-token
//! authentication against the tenant registry, session keys forced through
//! the session-key algebra, and the quota gate before the agent runner is
//! touched. A mismatched tenant prefix is a hard 403; the tools-invocation
//! endpoint rejects tenant tokens outright.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gateway::GatewayState;
use crate::quota::QuotaDecision;
use crate::session_key::{parse_tenant_session_key, scope_session_key_to_tenant};
use crate::settings;
use crate::tenant::token::{hash_secret, verify_secret};
use crate::tenant::TenantContext;

/// OpenAI-style error envelope.
fn compat_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": { "type": kind, "message": message.into() }
        })),
    )
        .into_response()
}

/// Resolve the bearer token: a tenant context, or `None` for the gateway
/// admin secret.
async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<Option<TenantContext>, Response> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            compat_error(
                StatusCode::UNAUTHORIZED,
                "invalid_request_error",
                "missing bearer token",
            )
        })?;

    if bearer.starts_with("tenant:") {
        let context = state.registry.validate_token(bearer).await.ok_or_else(|| {
            compat_error(
                StatusCode::UNAUTHORIZED,
                "invalid_request_error",
                "invalid or disabled tenant token",
            )
        })?;
        return Ok(Some(context));
    }

    if let Some(configured) = state.config.control_plane_token.as_deref() {
        if verify_secret(bearer, &hash_secret(configured)) {
            return Ok(None);
        }
    }
    Err(compat_error(
        StatusCode::UNAUTHORIZED,
        "invalid_request_error",
        "unknown bearer token",
    ))
}

/// Common pipeline shared by both chat endpoints: scope the session key, run
/// the quota gate, call the agent runner, account the tokens.
async fn run_pipeline(
    state: &GatewayState,
    tenant: Option<&TenantContext>,
    requested_key: Option<String>,
    input: String,
) -> Result<(String, crate::agent::AgentReply), Response> {
    let tenant_id = tenant.map(|t| t.tenant_id.as_str());

    let default_agent = match tenant_id {
        Some(id) => settings::load_overlay(&state.paths, id)
            .map(|overlay| settings::resolve_default_agent(&overlay))
            .unwrap_or_else(|_| settings::DEFAULT_AGENT_ID.to_string()),
        None => settings::DEFAULT_AGENT_ID.to_string(),
    };
    let requested_key = requested_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| format!("agent:{default_agent}:openai:{}", Uuid::new_v4()));

    let session_key = scope_session_key_to_tenant(&requested_key, tenant_id)
        .map_err(|err| compat_error(StatusCode::FORBIDDEN, "forbidden", err))?;

    if let Some(tenant) = tenant {
        let quotas = state.registry.quotas(&tenant.tenant_id);
        match state
            .ledger
            .check_quota_before_request(&tenant.tenant_id, quotas.as_ref())
            .await
        {
            Ok(QuotaDecision::Allowed { .. }) => {}
            Ok(QuotaDecision::Denied {
                reason, message, ..
            }) => {
                let kind = serde_json::to_value(reason)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "quota_exceeded".to_string());
                return Err(compat_error(StatusCode::TOO_MANY_REQUESTS, &kind, message));
            }
            Err(err) => {
                return Err(compat_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    format!("quota check failed: {err:#}"),
                ));
            }
        }
    }

    let agent_id = parse_tenant_session_key(&session_key)
        .map(|key| key.agent_id)
        .unwrap_or(default_agent);

    let reply = state
        .runner
        .run(&session_key, &agent_id, &input)
        .await
        .map_err(|err| {
            compat_error(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                format!("agent runner failed: {err:#}"),
            )
        })?;

    if let Some(tenant) = tenant {
        if let Err(err) = state
            .ledger
            .update_token_usage(
                &tenant.tenant_id,
                reply.input_tokens,
                reply.output_tokens,
                0,
                0,
                0,
            )
            .await
        {
            tracing::warn!("usage accounting failed for {}: {err:#}", tenant.tenant_id);
        }
    }
    Ok((session_key, reply))
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

impl ChatMessage {
    fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct ChatCompletionsRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    /// Explicit session key, with the OpenAI `user` field as a fallback.
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionsRequest>,
) -> Response {
    let tenant = match authenticate(&state, &headers).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    let input = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(ChatMessage::text)
        .unwrap_or_default();
    if input.is_empty() {
        return compat_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "messages must contain at least one user message",
        );
    }

    let requested_key = body.session_key.clone().or_else(|| body.user.clone());
    let (_, reply) = match run_pipeline(&state, tenant.as_ref(), requested_key, input).await {
        Ok(done) => done,
        Err(response) => return response,
    };

    Json(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": body.model.unwrap_or_else(|| "clawgate".to_string()),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply.text },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": reply.input_tokens,
            "completion_tokens": reply.output_tokens,
            "total_tokens": reply.input_tokens + reply.output_tokens,
        },
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct ResponsesRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

/// POST /v1/responses, sharing the chat pipeline with a different envelope.
pub async fn responses(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ResponsesRequest>,
) -> Response {
    let tenant = match authenticate(&state, &headers).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    let input = match &body.input {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| {
                p.as_str().map(str::to_string).or_else(|| {
                    p.get("content").and_then(Value::as_str).map(str::to_string)
                })
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if input.is_empty() {
        return compat_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "input is required",
        );
    }

    let requested_key = body.session_key.clone().or_else(|| body.user.clone());
    let (_, reply) = match run_pipeline(&state, tenant.as_ref(), requested_key, input).await {
        Ok(done) => done,
        Err(response) => return response,
    };

    Json(json!({
        "id": format!("resp_{}", Uuid::new_v4().simple()),
        "object": "response",
        "created_at": Utc::now().timestamp(),
        "model": body.model.unwrap_or_else(|| "clawgate".to_string()),
        "status": "completed",
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": reply.text }],
        }],
        "usage": {
            "input_tokens": reply.input_tokens,
            "output_tokens": reply.output_tokens,
            "total_tokens": reply.input_tokens + reply.output_tokens,
        },
    }))
    .into_response()
}

/// POST /v1/tools/invoke: tenant tokens are rejected outright; tool
/// execution is not exposed through the compat surface.
pub async fn tools_invoke(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Response {
    let tenant = match authenticate(&state, &headers).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if tenant.is_some() {
        return compat_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "tool invocation is not available for tenant tokens",
        );
    }
    compat_error(
        StatusCode::NOT_IMPLEMENTED,
        "not_implemented",
        "tool invocation is not exposed by this gateway",
    )
}
