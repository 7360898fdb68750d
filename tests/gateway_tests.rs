//! RPC-level integration tests: dispatch, authorization rails, terminals,
//! and scheduled jobs over a real state directory.

use serde_json::{json, Value};

use clawgate::gateway::authorize::{ConnectionAuth, Role};
use clawgate::gateway::connections::ClientHandle;
use clawgate::gateway::dispatch::dispatch;
use clawgate::gateway::protocol::RequestFrame;
use clawgate::gateway::GatewayState;

mod common;
use common::test_state;

fn tenant_auth(tenant: &str) -> ConnectionAuth {
    ConnectionAuth {
        role: Some(Role::Operator),
        scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
        tenant_id: Some(tenant.to_string()),
    }
}

fn admin_auth() -> ConnectionAuth {
    ConnectionAuth {
        role: Some(Role::Operator),
        scopes: vec!["operator.admin".to_string()],
        tenant_id: None,
    }
}

fn connect(state: &GatewayState, auth: ConnectionAuth) -> std::sync::Arc<ClientHandle> {
    state.connections.add_client(auth, None).0
}

async fn call(
    state: &GatewayState,
    client: &ClientHandle,
    method: &str,
    params: Value,
) -> (bool, Value) {
    let frame = RequestFrame {
        id: json!(1),
        method: method.to_string(),
        params: Some(params),
    };
    let response = dispatch(state, client, frame).await;
    let body = serde_json::to_value(&response).unwrap();
    (response.ok, body)
}

/// Scenario S1: create a tenant, then authenticate with the issued token.
#[tokio::test]
async fn test_create_and_authenticate_tenant() {
    let (_temp, state, _runner) = test_state();

    let token = state.registry.create("demo", None).await.unwrap();
    assert_eq!(state.registry.list(), vec!["demo".to_string()]);

    // tenant:demo:<urlsafe base64 secret, 32+ chars>
    let secret = token.strip_prefix("tenant:demo:").unwrap();
    assert!(secret.len() >= 32);
    assert!(secret
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

    let context = state.registry.validate_token(&token).await.unwrap();
    assert_eq!(context.tenant_id, "demo");
    assert!(context.state_dir.ends_with("tenants/demo"));
}

/// Scenario S2: tenant-authenticated connections cannot reach methods
/// outside the allow-list, whatever their scopes.
#[tokio::test]
async fn test_tenant_blocked_methods() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    for method in ["wizard.start", "status"] {
        let (ok, body) = call(&state, &client, method, json!({})).await;
        assert!(!ok, "{method} should be rejected");
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("method not available for tenant token"),
            "unexpected message for {method}: {}",
            body["error"]["message"]
        );
    }

    // health stays reachable.
    let (ok, _) = call(&state, &client, "health", json!({})).await;
    assert!(ok);
}

/// Scenario S5: PTY cross-tenant isolation through the full dispatch path.
#[tokio::test]
async fn test_terminal_cross_tenant_isolation() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    state.registry.create("tenant-b", None).await.unwrap();
    let a = connect(&state, tenant_auth("tenant-a"));
    let b = connect(&state, tenant_auth("tenant-b"));

    let (ok, body) = call(&state, &a, "terminal.spawn", json!({})).await;
    assert!(ok, "spawn failed: {body}");
    let terminal_id = body["payload"]["terminalId"].as_str().unwrap().to_string();

    let (ok, body) = call(
        &state,
        &b,
        "terminal.write",
        json!({ "terminalId": terminal_id, "data": "x" }),
    )
    .await;
    assert!(!ok);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (_, body) = call(&state, &a, "terminal.list", json!({})).await;
    let listed: Vec<&str> = body["payload"]["terminals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["terminalId"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec![terminal_id.as_str()]);

    let (_, body) = call(&state, &b, "terminal.list", json!({})).await;
    assert!(body["payload"]["terminals"].as_array().unwrap().is_empty());
}

/// Unknown terminals produce NOT_FOUND, malformed params INVALID_REQUEST.
#[tokio::test]
async fn test_terminal_error_taxonomy() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    let (ok, body) = call(
        &state,
        &client,
        "terminal.write",
        json!({ "terminalId": "no-such", "data": "x" }),
    )
    .await;
    assert!(!ok);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (ok, body) = call(&state, &client, "terminal.write", json!({ "data": "x" })).await;
    assert!(!ok);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

/// Cron jobs run under the tenant's cron session-key namespace and append a
/// run log readable via cron.runs.
#[tokio::test]
async fn test_cron_lifecycle_over_rpc() {
    let (_temp, state, runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    let (ok, body) = call(
        &state,
        &client,
        "cron.add",
        json!({ "name": "nightly", "schedule": "0 0 3 * * *", "payload": "summarize" }),
    )
    .await;
    assert!(ok, "cron.add failed: {body}");
    let job_id = body["payload"]["id"].as_str().unwrap().to_string();

    let (ok, _) = call(&state, &client, "cron.run", json!({ "jobId": job_id })).await;
    assert!(ok);

    let keys = runner.session_keys();
    assert_eq!(keys, vec![format!("tenant:tenant-a:cron:{job_id}")]);

    let (ok, body) = call(&state, &client, "cron.runs", json!({ "jobId": job_id })).await;
    assert!(ok);
    let runs = body["payload"]["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["ok"], true);

    let (ok, body) = call(&state, &client, "cron.list", json!({})).await;
    assert!(ok);
    assert_eq!(body["payload"]["jobs"].as_array().unwrap().len(), 1);
}

/// Scenario S6: an idle terminal is reaped and the originating connection
/// observes terminal.exit.
#[tokio::test]
async fn test_idle_reaper_emits_exit_to_owner() {
    use clawgate::gateway::connections::Outbound;
    use clawgate::terminal::IDLE_CUTOFF_SECS;

    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let (client, mut rx) = state.connections.add_client(tenant_auth("tenant-a"), None);

    let (ok, body) = call(&state, &client, "terminal.spawn", json!({})).await;
    assert!(ok, "spawn failed: {body}");
    let terminal_id = body["payload"]["terminalId"].as_str().unwrap().to_string();

    let later = chrono::Utc::now() + chrono::Duration::seconds(IDLE_CUTOFF_SECS + 1);
    let reaped = state.terminals.reap_once(later);
    assert_eq!(reaped, vec![terminal_id.clone()]);

    let mut saw_exit = false;
    while let Ok(message) = rx.try_recv() {
        if let Outbound::Text(text) = message {
            if text.contains("terminal.exit") && text.contains(&terminal_id) {
                saw_exit = true;
            }
        }
    }
    assert!(saw_exit, "terminal.exit not observed on owning connection");

    let (_, body) = call(&state, &client, "terminal.list", json!({})).await;
    assert!(body["payload"]["terminals"].as_array().unwrap().is_empty());
}

/// Session previews stay inside the tenant's sessions directory: traversal
/// segments are rejected before any path is built, legitimate keys resolve.
#[tokio::test]
async fn test_sessions_preview_confined_to_sessions_dir() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    state.registry.create("tenant-b", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    // A real transcript for the happy path.
    let sessions_dir = state.paths.tenant_sessions_dir("tenant-a", "beta");
    std::fs::create_dir_all(&sessions_dir).unwrap();
    std::fs::write(sessions_dir.join("chat1.jsonl"), "{\"role\":\"user\"}\n").unwrap();
    // A sibling tenant's transcript that must stay unreachable.
    let other_dir = state.paths.tenant_sessions_dir("tenant-b", "beta");
    std::fs::create_dir_all(&other_dir).unwrap();
    std::fs::write(other_dir.join("secret.jsonl"), "{\"secret\":true}\n").unwrap();

    let (ok, body) = call(
        &state,
        &client,
        "sessions.preview",
        json!({ "sessionKey": "agent:beta:chat1" }),
    )
    .await;
    assert!(ok, "legitimate preview failed: {body}");
    assert_eq!(body["payload"]["lines"].as_array().unwrap().len(), 1);

    for hostile in [
        "agent:beta:../../../../../../etc/passwd",
        "agent:beta:../../../tenant-b/agents/beta/sessions/secret",
        "agent:..:secret",
    ] {
        let (ok, body) = call(
            &state,
            &client,
            "sessions.preview",
            json!({ "sessionKey": hostile }),
        )
        .await;
        assert!(!ok, "hostile key {hostile:?} was accepted");
        assert_eq!(body["error"]["code"], "INVALID_REQUEST", "key {hostile:?}");
    }
}

/// cron.runs resolves a run-log path only for ids present in the caller's
/// own job store.
#[tokio::test]
async fn test_cron_runs_requires_existing_job() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    for hostile in [
        "../../../../tenants/tenant-b/cron/runs-abc",
        "no-such-job",
    ] {
        let (ok, body) = call(&state, &client, "cron.runs", json!({ "jobId": hostile })).await;
        assert!(!ok, "jobId {hostile:?} was accepted");
        assert_eq!(body["error"]["code"], "NOT_FOUND", "jobId {hostile:?}");
    }
}

/// Rate limits deny with a retry-after hint through the dispatch quota gate.
#[tokio::test]
async fn test_quota_gate_rate_limits_chargeable_methods() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    state
        .registry
        .update(
            "tenant-a",
            clawgate::tenant::TenantUpdate {
                quotas: Some(clawgate::tenant::TenantQuotas {
                    requests_per_minute: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    let (ok, _) = call(&state, &client, "terminal.spawn", json!({})).await;
    assert!(ok);

    let (ok, body) = call(&state, &client, "terminal.spawn", json!({})).await;
    assert!(!ok);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    assert_eq!(body["error"]["details"]["reason"], "rate_limited");
    assert!(body["error"]["retryAfterMs"].is_number());
}

/// Disabling a tenant evicts its connections and kills its terminals.
#[tokio::test]
async fn test_disable_tenant_tears_down() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let admin = connect(&state, admin_auth());
    let a = connect(&state, tenant_auth("tenant-a"));

    let (ok, _) = call(&state, &a, "terminal.spawn", json!({})).await;
    assert!(ok);
    assert_eq!(state.connections.len(), 2);

    let (ok, _) = call(
        &state,
        &admin,
        "tenants.update",
        json!({ "tenantId": "tenant-a", "disabled": true }),
    )
    .await;
    assert!(ok);

    assert_eq!(state.connections.len(), 1);
    assert!(state.terminals.list(&admin_auth()).is_empty());
}

/// Config overlay round trip with merge-patch semantics and admin-key
/// stripping.
#[tokio::test]
async fn test_config_overlay_rpcs() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    let client = connect(&state, tenant_auth("tenant-a"));

    let (ok, _) = call(
        &state,
        &client,
        "config.set",
        json!({ "config": { "defaultAgent": "beta", "quotas": { "monthlyTokens": 1 } } }),
    )
    .await;
    assert!(ok);

    let (_, body) = call(&state, &client, "config.get", json!({})).await;
    assert_eq!(body["payload"]["config"]["defaultAgent"], "beta");
    assert!(body["payload"]["config"].get("quotas").is_none());

    let (ok, body) = call(
        &state,
        &client,
        "config.patch",
        json!({ "patch": { "defaultAgent": null, "voicewake": { "enabled": true } } }),
    )
    .await;
    assert!(ok);
    assert!(body["payload"]["config"].get("defaultAgent").is_none());
    assert_eq!(body["payload"]["config"]["voicewake"]["enabled"], true);
}

/// Usage snapshots accumulate and the quota status reports unclamped
/// percentages.
#[tokio::test]
async fn test_usage_and_quota_status() {
    let (_temp, state, _runner) = test_state();
    state.registry.create("tenant-a", None).await.unwrap();
    state
        .registry
        .update(
            "tenant-a",
            clawgate::tenant::TenantUpdate {
                quotas: Some(clawgate::tenant::TenantQuotas {
                    monthly_tokens: Some(100),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    state
        .ledger
        .update_token_usage("tenant-a", 100, 50, 0, 0, 3)
        .await
        .unwrap();

    let client = connect(&state, tenant_auth("tenant-a"));
    let (ok, body) = call(&state, &client, "tenant.quota.status", json!({})).await;
    assert!(ok);
    assert_eq!(body["payload"]["usage"]["totalTokens"], 150);
    // 150 of 100: over the cap, reported unclamped.
    assert_eq!(body["payload"]["percentUsed"]["tokens"], 150.0);
}
