//! Request dispatch: authorize, quota-gate, validate, run the handler.

use log::{debug, error};
use serde_json::{json, Value};

use crate::quota::QuotaDecision;

use super::authorize::authorize;
use super::connections::ClientHandle;
use super::handlers;
use super::protocol::{ErrorShape, RequestFrame, ResponseFrame};
use super::GatewayState;

/// Methods that consume agent or sandbox resources; tenant calls pass the
/// quota gate before the handler runs.
const CHARGEABLE_METHODS: [&str; 2] = ["terminal.spawn", "cron.run"];

/// Dispatch one request frame to its handler and build the response frame.
///
/// Handler panics cannot happen by construction (no unwraps on foreign
/// data); handler errors become structured error responses, with anything
/// internal mapped to `UNAVAILABLE` and logged.
pub async fn dispatch(
    state: &GatewayState,
    client: &ClientHandle,
    frame: RequestFrame,
) -> ResponseFrame {
    let RequestFrame { id, method, params } = frame;
    debug!("conn {}: dispatching {method}", client.conn_id);

    if let Err(err) = authorize(&method, &client.auth) {
        return ResponseFrame::err(id, err);
    }

    let mut quota_warning = None;
    if client.auth.tenant_id.is_some() && CHARGEABLE_METHODS.contains(&method.as_str()) {
        let tenant_id = client.auth.tenant_id.clone().unwrap_or_default();
        let quotas = state.registry.quotas(&tenant_id);
        match state
            .ledger
            .check_quota_before_request(&tenant_id, quotas.as_ref())
            .await
        {
            Ok(QuotaDecision::Allowed { warning }) => quota_warning = warning,
            Ok(QuotaDecision::Denied {
                reason,
                message,
                retry_after_ms,
            }) => {
                let mut err = ErrorShape::invalid_request(message)
                    .with_details(json!({ "reason": reason }));
                if let Some(ms) = retry_after_ms {
                    err = err.with_retry_after_ms(ms);
                }
                return ResponseFrame::err(id, err);
            }
            Err(err) => {
                error!("quota gate failed for tenant {tenant_id}: {err:#}");
                return ResponseFrame::err(
                    id,
                    ErrorShape::unavailable("quota check failed"),
                );
            }
        }
    }

    let result = run_handler(state, client, &method, params.as_ref()).await;
    match result {
        Ok(payload) => match quota_warning {
            Some(warning) => ResponseFrame::ok_with_meta(
                id,
                payload,
                json!({ "quotaWarning": warning }),
            ),
            None => ResponseFrame::ok(id, payload),
        },
        Err(err) => ResponseFrame::err(id, err),
    }
}

async fn run_handler(
    state: &GatewayState,
    client: &ClientHandle,
    method: &str,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    match method {
        // Liveness and gateway snapshot.
        "health" => Ok(handlers::misc::handle_health()),
        "status" => Ok(handlers::misc::handle_status(state)),

        // Admin tenant CRUD.
        "tenants.create" => handlers::tenants::handle_tenants_create(state, params).await,
        "tenants.list" => handlers::tenants::handle_tenants_list(state),
        "tenants.get" => handlers::tenants::handle_tenants_get(state, params),
        "tenants.update" => handlers::tenants::handle_tenants_update(state, params).await,
        "tenants.remove" => handlers::tenants::handle_tenants_remove(state, params).await,

        // Tenant self-management.
        "tenant.get" => handlers::tenants::handle_tenant_get(state, client),
        "tenant.rotate" => handlers::tenants::handle_tenant_rotate(state, client).await,
        "tenant.delete" => handlers::tenants::handle_tenant_delete(state, client, params).await,
        "tenant.usage" => handlers::tenants::handle_tenant_usage(state, client, params).await,
        "tenant.usage.history" => {
            handlers::tenants::handle_tenant_usage_history(state, client, params)
        }
        "tenant.quota.status" => {
            handlers::tenants::handle_tenant_quota_status(state, client).await
        }
        "tenant.backup" => handlers::tenants::handle_tenant_backup(state, client).await,
        "tenant.backups.list" => {
            handlers::tenants::handle_tenant_backups_list(state, client).await
        }
        "tenant.restore" => handlers::tenants::handle_tenant_restore(state, client, params).await,

        // Tenant config overlay.
        "config.get" => handlers::config::handle_config_get(state, client),
        "config.set" => handlers::config::handle_config_set(state, client, params),
        "config.patch" => handlers::config::handle_config_patch(state, client, params),
        "config.schema" => Ok(handlers::config::handle_config_schema()),
        "voicewake.get" => handlers::config::handle_voicewake_get(state, client),
        "voicewake.set" => handlers::config::handle_voicewake_set(state, client, params),

        // Agent records.
        "agents.list" => handlers::agents::handle_agents_list(state, client),
        "agents.get" => handlers::agents::handle_agents_get(state, client, params),
        "agents.create" => handlers::agents::handle_agents_create(state, client, params),
        "agents.update" => handlers::agents::handle_agents_update(state, client, params),
        "agents.delete" => handlers::agents::handle_agents_delete(state, client, params),

        // Sessions, read-only.
        "sessions.list" => handlers::sessions::handle_sessions_list(state, client, params),
        "sessions.preview" => handlers::sessions::handle_sessions_preview(state, client, params),

        // Terminals.
        "terminal.spawn" => handlers::terminal::handle_terminal_spawn(state, client, params),
        "terminal.write" => handlers::terminal::handle_terminal_write(state, client, params),
        "terminal.resize" => handlers::terminal::handle_terminal_resize(state, client, params),
        "terminal.close" => handlers::terminal::handle_terminal_close(state, client, params),
        "terminal.list" => handlers::terminal::handle_terminal_list(state, client),

        // Scheduled jobs.
        "cron.status" => handlers::cron::handle_cron_status(state, client),
        "cron.list" => handlers::cron::handle_cron_list(state, client),
        "cron.add" => handlers::cron::handle_cron_add(state, client, params),
        "cron.update" => handlers::cron::handle_cron_update(state, client, params),
        "cron.remove" => handlers::cron::handle_cron_remove(state, client, params),
        "cron.run" => handlers::cron::handle_cron_run(state, client, params).await,
        "cron.runs" => handlers::cron::handle_cron_runs(state, client, params),

        // Skills.
        "skills.status" => handlers::skills::handle_skills_status(state, client),
        "skills.list" => handlers::skills::handle_skills_list(state, client),
        "skills.install" => handlers::skills::handle_skills_install(state, client, params),
        "skills.update" => handlers::skills::handle_skills_update(state, client, params),
        "skills.remove" => handlers::skills::handle_skills_remove(state, client, params),

        // Channels.
        "channels.status" => handlers::channels::handle_channels_status(state, client),
        "channels.start" => handlers::channels::handle_channels_start(state, client, params),
        "channels.stop" => handlers::channels::handle_channels_stop(state, client, params),
        "channels.logout" => handlers::channels::handle_channels_logout(state, client, params),

        // Pairing.
        "device.pair.list" => handlers::pairing::handle_device_pair_list(state),
        "device.pair.approve" => handlers::pairing::handle_device_pair_approve(state, params),
        "device.pair.reject" => handlers::pairing::handle_device_pair_reject(state, params),
        "device.token.rotate" => handlers::pairing::handle_device_token_rotate(state, params),
        "device.token.revoke" => handlers::pairing::handle_device_token_revoke(state, params),
        "node.pair.request" => handlers::pairing::handle_node_pair_request(state, params),
        "node.pair.list" => handlers::pairing::handle_node_pair_list(state),
        "node.pair.approve" => handlers::pairing::handle_node_pair_approve(state, params),
        "node.pair.reject" => handlers::pairing::handle_node_pair_reject(state, params),
        "node.pair.verify" => handlers::pairing::handle_node_pair_verify(state, params),
        "node.list" => handlers::pairing::handle_node_list(state),
        "node.describe" => handlers::pairing::handle_node_describe(state, params),
        "node.rename" => handlers::pairing::handle_node_rename(state, params),

        // Approvals policy.
        "exec.approvals.get" => handlers::misc::handle_approvals_get(state),
        "exec.approvals.set" => handlers::misc::handle_approvals_set(state, params),

        // Setup wizard (not enabled on a multi-tenant gateway).
        "wizard.status" => Ok(json!({ "active": false })),
        "wizard.start" | "wizard.next" | "wizard.cancel" => Err(ErrorShape::unavailable(
            "setup wizard is not enabled on this gateway",
        )),

        other => Err(ErrorShape::invalid_request(format!(
            "unknown method '{other}'"
        ))),
    }
}
