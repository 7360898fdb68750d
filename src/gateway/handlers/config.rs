//! Tenant config overlay RPCs and the voice-wake fields inside it.

use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::settings;

use super::tenants::map_anyhow;
use super::tenant_scope;

pub fn handle_config_get(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, None)?;
    let overlay = settings::load_overlay(&state.paths, &tenant_id).map_err(map_anyhow)?;
    Ok(json!({ "config": overlay }))
}

pub fn handle_config_set(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let config = params
        .and_then(|p| p.get("config"))
        .cloned()
        .ok_or_else(|| ErrorShape::invalid_request("config object is required"))?;
    if !config.is_object() {
        return Err(ErrorShape::invalid_request("config must be an object"));
    }
    let saved = settings::save_overlay(&state.paths, &tenant_id, config).map_err(map_anyhow)?;
    Ok(json!({ "config": saved }))
}

pub fn handle_config_patch(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let patch = params
        .and_then(|p| p.get("patch"))
        .cloned()
        .ok_or_else(|| ErrorShape::invalid_request("patch object is required"))?;
    let merged = settings::patch_overlay(&state.paths, &tenant_id, patch).map_err(map_anyhow)?;
    Ok(json!({ "config": merged }))
}

pub fn handle_config_schema() -> Value {
    json!({ "schema": settings::overlay_schema() })
}

pub fn handle_voicewake_get(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, None)?;
    let overlay = settings::load_overlay(&state.paths, &tenant_id).map_err(map_anyhow)?;
    Ok(overlay
        .get("voicewake")
        .cloned()
        .unwrap_or_else(|| json!({ "enabled": false, "phrases": [] })))
}

pub fn handle_voicewake_set(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let enabled = params
        .and_then(|p| p.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let phrases = params
        .and_then(|p| p.get("phrases"))
        .cloned()
        .unwrap_or_else(|| json!([]));
    if !phrases.is_array() {
        return Err(ErrorShape::invalid_request("phrases must be an array"));
    }
    let merged = settings::patch_overlay(
        &state.paths,
        &tenant_id,
        json!({ "voicewake": { "enabled": enabled, "phrases": phrases } }),
    )
    .map_err(map_anyhow)?;
    Ok(merged.get("voicewake").cloned().unwrap_or(Value::Null))
}
