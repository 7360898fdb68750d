//! Health, status, and the approvals policy document.

use std::fs;

use chrono::Utc;
use serde_json::{json, Value};

use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;

use super::parse_params;

pub fn handle_health() -> Value {
    json!({
        "status": "healthy",
        "ts": Utc::now().timestamp_millis(),
    })
}

/// Gateway snapshot: version, uptime, counts, most recent host sample.
pub fn handle_status(state: &GatewayState) -> Value {
    let (global_running, tenant_running) = state.schedulers.status();
    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.started_at.elapsed().as_millis() as u64,
        "runtime": {
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "connections": state.connections.len(),
        "tenants": state.registry.list().len(),
        "schedulers": {
            "global": global_running,
            "tenantsRunning": tenant_running,
        },
        "system": state.metrics.latest(),
    })
}

fn approvals_path(state: &GatewayState) -> std::path::PathBuf {
    state.paths.root().join("approvals.json")
}

/// Read the global exec-approvals policy (default: prompt).
pub fn handle_approvals_get(state: &GatewayState) -> Result<Value, ErrorShape> {
    let path = approvals_path(state);
    match fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|err| ErrorShape::unavailable(format!("approvals store corrupt: {err}"))),
        Err(_) => Ok(json!({ "mode": "prompt" })),
    }
}

#[derive(serde::Deserialize)]
struct ApprovalsSetParams {
    mode: String,
}

/// Replace the global exec-approvals policy.
pub fn handle_approvals_set(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: ApprovalsSetParams = parse_params(params)?;
    if !matches!(parsed.mode.as_str(), "prompt" | "auto" | "deny") {
        return Err(ErrorShape::invalid_request(
            "mode must be one of prompt|auto|deny",
        ));
    }
    let doc = json!({ "mode": parsed.mode, "updatedAt": Utc::now() });
    let path = approvals_path(state);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ErrorShape::unavailable(format!("approvals store: {err}")))?;
    }
    fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap_or_default())
        .map_err(|err| ErrorShape::unavailable(format!("approvals store: {err}")))?;
    Ok(doc)
}
