//! Internal control-plane API under `/internal/v1`.
//!
//! Out-of-band tenant management for operators and automation. Every request
//! carries `X-Control-Plane-Token`, compared in constant time against the
//! configured secret; with no secret configured the whole surface denies.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::gateway::GatewayState;
use crate::tenant::token::{hash_secret, verify_secret};
use crate::tenant::{TenantQuotas, TenantUpdate};

use super::error::ApiError;

/// Header carrying the control-plane secret.
pub const CONTROL_PLANE_HEADER: &str = "x-control-plane-token";

fn require_control_token(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let configured = state
        .config
        .control_plane_token
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("control plane is not configured"))?;
    let presented = headers
        .get(CONTROL_PLANE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing control-plane token"))?;
    if !verify_secret(presented, &hash_secret(configured)) {
        return Err(ApiError::unauthorized("invalid control-plane token"));
    }
    Ok(())
}

/// GET /internal/v1/status
pub async fn get_status(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    let (global_running, tenants_running) = state.schedulers.status();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["tenants", "backups", "terminals", "cron", "openai-compat"],
        "tenantCount": state.registry.list().len(),
        "process": {
            "uptimeMs": state.started_at.elapsed().as_millis() as u64,
            "connections": state.connections.len(),
            "schedulers": { "global": global_running, "tenantsRunning": tenants_running },
            "system": state.metrics.latest(),
        },
    }))
    .into_response())
}

/// GET /internal/v1/tenants/{tenantId}
pub async fn get_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    let entry = state
        .registry
        .get(&tenant_id)
        .ok_or_else(|| ApiError::not_found(format!("tenant '{tenant_id}' not found")))?;
    Ok(Json(json!({
        "tenantId": tenant_id,
        "displayName": entry.display_name,
        "disabled": entry.disabled,
        "createdAt": entry.created_at,
        "lastSeenAt": entry.last_seen_at,
        "quotas": entry.quotas,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTenantBody {
    display_name: Option<String>,
    quotas: Option<TenantQuotas>,
}

/// POST /internal/v1/tenants/{tenantId}
pub async fn create_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    body: Option<Json<CreateTenantBody>>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let token = state
        .registry
        .create(&tenant_id, body.display_name)
        .await
        .map_err(ApiError::from_anyhow)?;
    if body.quotas.is_some() {
        state
            .registry
            .update(
                &tenant_id,
                TenantUpdate {
                    quotas: body.quotas,
                    ..Default::default()
                },
            )
            .await
            .map_err(ApiError::from_anyhow)?;
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "tenantId": tenant_id, "token": token })),
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteTenantQuery {
    delete_data: bool,
}

/// DELETE /internal/v1/tenants/{tenantId}
pub async fn delete_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<DeleteTenantQuery>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    state.teardown_tenant(&tenant_id);
    state
        .registry
        .remove(&tenant_id, query.delete_data)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({ "removed": tenant_id, "deletedData": query.delete_data })).into_response())
}

/// POST /internal/v1/tenants/{tenantId}/backup
pub async fn post_backup(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    let info = state
        .backups
        .backup(&tenant_id, None)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!(info)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreBody {
    key: String,
    #[serde(default)]
    create_if_missing: bool,
}

/// POST /internal/v1/tenants/{tenantId}/restore
pub async fn post_restore(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    state
        .backups
        .restore(&tenant_id, &body.key, body.create_if_missing)
        .await
        .map_err(ApiError::from_anyhow)?;
    state.disk_cache.invalidate(&tenant_id);
    Ok(Json(json!({ "restored": tenant_id, "key": body.key })).into_response())
}

/// GET /internal/v1/tenants/{tenantId}/backups
pub async fn get_backups(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    let backups = state
        .backups
        .list_backups(&tenant_id)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({ "backups": backups })).into_response())
}

/// DELETE /internal/v1/tenants/{tenantId}/backups/{*key}
pub async fn delete_backup(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((tenant_id, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    require_control_token(&state, &headers)?;
    state
        .backups
        .delete_backup(&tenant_id, &key)
        .await
        .map_err(|err| {
            let message = format!("{err:#}");
            if message.contains("does not belong") {
                ApiError::bad_request(message)
            } else {
                ApiError::from_anyhow(err)
            }
        })?;
    Ok(Json(json!({ "deleted": key })).into_response())
}

/// Fallback for unrecognized paths under the prefix.
pub async fn not_found() -> ApiError {
    ApiError::not_found("no such control-plane resource")
}
