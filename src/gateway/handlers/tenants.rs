//! Tenant CRUD (admin) and tenant self-management.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::quota::percent_of;
use crate::tenant::{TenantEntry, TenantQuotas, TenantUpdate};

use super::{parse_params, require_tenant};

/// Categorize a service-layer error into the RPC taxonomy by message shape.
pub(crate) fn map_anyhow(err: anyhow::Error) -> ErrorShape {
    let message = format!("{err:#}");
    let lower = message.to_lowercase();
    if lower.contains("not found") {
        ErrorShape::not_found(message)
    } else if lower.contains("invalid") || lower.contains("already exists") {
        ErrorShape::invalid_request(message)
    } else {
        ErrorShape::unavailable(message)
    }
}

/// Public view of a tenant record; the token hash never leaves the registry.
fn entry_summary(tenant_id: &str, entry: &TenantEntry) -> Value {
    json!({
        "tenantId": tenant_id,
        "displayName": entry.display_name,
        "disabled": entry.disabled,
        "createdAt": entry.created_at,
        "lastSeenAt": entry.last_seen_at,
        "quotas": entry.quotas,
    })
}

// ============================================================================
// Admin CRUD
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantsCreateParams {
    tenant_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

pub async fn handle_tenants_create(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: TenantsCreateParams = parse_params(params)?;
    let token = state
        .registry
        .create(&parsed.tenant_id, parsed.display_name)
        .await
        .map_err(map_anyhow)?;
    Ok(json!({ "tenantId": parsed.tenant_id, "token": token }))
}

pub fn handle_tenants_list(state: &GatewayState) -> Result<Value, ErrorShape> {
    let tenants: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .filter_map(|id| {
            state
                .registry
                .get(&id)
                .map(|entry| entry_summary(&id, &entry))
        })
        .collect();
    Ok(json!({ "tenants": tenants }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantIdParams {
    tenant_id: String,
}

pub fn handle_tenants_get(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: TenantIdParams = parse_params(params)?;
    let entry = state
        .registry
        .get(&parsed.tenant_id)
        .ok_or_else(|| ErrorShape::not_found(format!("tenant '{}' not found", parsed.tenant_id)))?;
    Ok(entry_summary(&parsed.tenant_id, &entry))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantsUpdateParams {
    tenant_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    disabled: Option<bool>,
    #[serde(default)]
    quotas: Option<TenantQuotas>,
}

pub async fn handle_tenants_update(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: TenantsUpdateParams = parse_params(params)?;
    let entry = state
        .registry
        .update(
            &parsed.tenant_id,
            TenantUpdate {
                display_name: parsed.display_name,
                disabled: parsed.disabled,
                quotas: parsed.quotas,
            },
        )
        .await
        .map_err(map_anyhow)?;
    if entry.disabled {
        state.teardown_tenant(&parsed.tenant_id);
    }
    Ok(entry_summary(&parsed.tenant_id, &entry))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantsRemoveParams {
    tenant_id: String,
    #[serde(default)]
    delete_data: bool,
}

pub async fn handle_tenants_remove(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: TenantsRemoveParams = parse_params(params)?;
    state.teardown_tenant(&parsed.tenant_id);
    state
        .registry
        .remove(&parsed.tenant_id, parsed.delete_data)
        .await
        .map_err(map_anyhow)?;
    Ok(json!({ "removed": parsed.tenant_id, "deletedData": parsed.delete_data }))
}

// ============================================================================
// Tenant self-management
// ============================================================================

pub fn handle_tenant_get(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let entry = state
        .registry
        .get(&tenant_id)
        .ok_or_else(|| ErrorShape::not_found(format!("tenant '{tenant_id}' not found")))?;
    Ok(entry_summary(&tenant_id, &entry))
}

pub async fn handle_tenant_rotate(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let token = state.registry.rotate(&tenant_id).await.map_err(map_anyhow)?;
    Ok(json!({ "tenantId": tenant_id, "token": token }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TenantDeleteParams {
    delete_data: bool,
}

pub async fn handle_tenant_delete(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let parsed: TenantDeleteParams = parse_params(params)?;
    state.teardown_tenant(&tenant_id);
    state
        .registry
        .remove(&tenant_id, parsed.delete_data)
        .await
        .map_err(map_anyhow)?;
    Ok(json!({ "removed": tenant_id, "deletedData": parsed.delete_data }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TenantUsageParams {
    /// Recompute the (slow) disk decomposition instead of reporting the last
    /// recorded value.
    refresh: bool,
}

pub async fn handle_tenant_usage(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let parsed: TenantUsageParams = parse_params(params)?;
    if parsed.refresh {
        let disk = state
            .disk_cache
            .compute(&tenant_id)
            .await
            .map_err(map_anyhow)?;
        let snapshot = state
            .ledger
            .record_disk_usage(&tenant_id, disk)
            .await
            .map_err(map_anyhow)?;
        return Ok(json!(snapshot));
    }
    let snapshot = state.ledger.load_usage(&tenant_id).await.map_err(map_anyhow)?;
    Ok(json!(snapshot))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UsageHistoryParams {
    period: Option<String>,
}

pub fn handle_tenant_usage_history(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let parsed: UsageHistoryParams = parse_params(params)?;
    match parsed.period {
        Some(period) => {
            let snapshot = state
                .ledger
                .archived_snapshot(&tenant_id, &period)
                .ok_or_else(|| {
                    ErrorShape::not_found(format!("no archived usage for period '{period}'"))
                })?;
            Ok(json!(snapshot))
        }
        None => Ok(json!({ "periods": state.ledger.archived_periods(&tenant_id) })),
    }
}

pub async fn handle_tenant_quota_status(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let usage = state.ledger.load_usage(&tenant_id).await.map_err(map_anyhow)?;
    let quotas = state.registry.quotas(&tenant_id);

    // Percentages are intentionally unclamped; over 100 means breached.
    let mut percents = serde_json::Map::new();
    if let Some(quotas) = &quotas {
        if let Some(cap) = quotas.monthly_tokens {
            percents.insert("tokens".into(), json!(percent_of(usage.total_tokens, cap)));
        }
        if let Some(cap) = quotas.monthly_cost_cents {
            percents.insert("cost".into(), json!(percent_of(usage.cost_cents, cap)));
        }
        if let Some(cap) = quotas.disk_bytes {
            percents.insert("disk".into(), json!(percent_of(usage.disk.total_bytes, cap)));
        }
        if let Some(cap) = quotas.concurrent_sessions {
            percents.insert(
                "sessions".into(),
                json!(percent_of(usage.active_sessions as u64, cap as u64)),
            );
        }
    }
    Ok(json!({
        "tenantId": tenant_id,
        "quotas": quotas,
        "usage": usage,
        "percentUsed": percents,
    }))
}

pub async fn handle_tenant_backup(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let info = state
        .backups
        .backup(&tenant_id, None)
        .await
        .map_err(map_anyhow)?;
    Ok(json!(info))
}

pub async fn handle_tenant_backups_list(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let backups = state
        .backups
        .list_backups(&tenant_id)
        .await
        .map_err(map_anyhow)?;
    Ok(json!({ "backups": backups }))
}

#[derive(Deserialize)]
struct TenantRestoreParams {
    key: String,
}

pub async fn handle_tenant_restore(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = require_tenant(client)?;
    let parsed: TenantRestoreParams = parse_params(params)?;
    state
        .backups
        .restore(&tenant_id, &parsed.key, false)
        .await
        .map_err(map_anyhow)?;
    state.disk_cache.invalidate(&tenant_id);
    Ok(json!({ "restored": tenant_id, "key": parsed.key }))
}
