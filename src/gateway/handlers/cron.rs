//! Scheduled-job RPCs.
//!
//! Tenant callers operate on their own job store; non-tenant callers on the
//! global one. A tenant scheduler is ensured (constructed, and started when
//! scheduling is enabled) on the first mutating call.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cron::{JobSpec, JobStore, JobUpdate, Scheduler};
use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;

use super::tenants::map_anyhow;
use super::parse_params;

/// Job store for read-only calls; does not construct a scheduler.
fn read_store(state: &GatewayState, client: &ClientHandle) -> JobStore {
    match client.auth.tenant_id.as_deref() {
        Some(tenant) => JobStore::new(state.paths.tenant_cron_jobs(tenant)),
        None => JobStore::new(state.paths.global_cron_jobs()),
    }
}

/// Scheduler for mutating calls: ensure-on-first-add for tenants.
fn write_scheduler(state: &GatewayState, client: &ClientHandle) -> std::sync::Arc<Scheduler> {
    match client.auth.tenant_id.as_deref() {
        Some(tenant) => state.schedulers.ensure_tenant(tenant),
        None => state.schedulers.get_global(),
    }
}

pub fn handle_cron_status(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let running = match client.auth.tenant_id.as_deref() {
        Some(tenant) => state
            .schedulers
            .get_tenant(tenant)
            .map(|s| s.is_running())
            .unwrap_or(false),
        None => state.schedulers.get_global().is_running(),
    };
    let jobs = read_store(state, client).load();
    Ok(json!({
        "running": running,
        "jobs": jobs.len(),
        "enabled": jobs.iter().filter(|j| j.enabled).count(),
    }))
}

pub fn handle_cron_list(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    Ok(json!({ "jobs": read_store(state, client).load() }))
}

pub fn handle_cron_add(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let spec: JobSpec = parse_params(params)?;
    let scheduler = write_scheduler(state, client);
    let job = scheduler.store().add(spec).map_err(map_anyhow)?;
    Ok(json!(job))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobUpdateParams {
    job_id: String,
    #[serde(flatten)]
    update: JobUpdate,
}

pub fn handle_cron_update(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: JobUpdateParams = parse_params(params)?;
    let scheduler = write_scheduler(state, client);
    let job = scheduler
        .store()
        .update(&parsed.job_id, parsed.update)
        .map_err(map_anyhow)?;
    Ok(json!(job))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdParams {
    job_id: String,
}

pub fn handle_cron_remove(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: JobIdParams = parse_params(params)?;
    let scheduler = write_scheduler(state, client);
    scheduler.store().remove(&parsed.job_id).map_err(map_anyhow)?;
    Ok(json!({ "removed": parsed.job_id }))
}

pub async fn handle_cron_run(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: JobIdParams = parse_params(params)?;
    let scheduler = write_scheduler(state, client);
    if !scheduler.run_job_by_id(&parsed.job_id).await {
        return Err(ErrorShape::not_found(format!(
            "job '{}' not found",
            parsed.job_id
        )));
    }
    Ok(json!({ "ran": parsed.job_id }))
}

pub fn handle_cron_runs(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: JobIdParams = parse_params(params)?;
    // The job id is interpolated into the run-log file name; only ids that
    // exist in the caller's own store ever reach path resolution.
    if read_store(state, client).get(&parsed.job_id).is_none() {
        return Err(ErrorShape::not_found(format!(
            "job '{}' not found",
            parsed.job_id
        )));
    }
    let scheduler = match client.auth.tenant_id.as_deref() {
        Some(tenant) => state
            .schedulers
            .get_tenant(tenant)
            .unwrap_or_else(|| state.schedulers.ensure_tenant(tenant)),
        None => state.schedulers.get_global(),
    };
    Ok(json!({ "runs": scheduler.run_log(&parsed.job_id) }))
}
