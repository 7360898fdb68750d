//! Per-tenant channel lifecycle.
//!
//! Channels (messaging integrations) are run by an external worker; the
//! gateway tracks desired state and reports status. Registry keys are
//! `{scope}:{channel}` where scope is a tenant id or `global`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;

use super::parse_params;

/// Lifecycle states a channel moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Stopped,
    Running,
    LoggedOut,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub channel: String,
    pub status: ChannelStatus,
    pub changed_at: DateTime<Utc>,
}

/// In-memory channel registry.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    entries: Arc<DashMap<String, ChannelState>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: &str, channel: &str) -> String {
        format!("{scope}:{channel}")
    }

    fn set(&self, scope: &str, channel: &str, status: ChannelStatus) -> ChannelState {
        let state = ChannelState {
            channel: channel.to_string(),
            status,
            changed_at: Utc::now(),
        };
        self.entries
            .insert(Self::key(scope, channel), state.clone());
        state
    }

    fn list(&self, scope: &str) -> Vec<ChannelState> {
        let prefix = format!("{scope}:");
        let mut out: Vec<ChannelState> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.channel.cmp(&b.channel));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn scope_of(client: &ClientHandle) -> String {
    client
        .auth
        .tenant_id
        .clone()
        .unwrap_or_else(|| "global".to_string())
}

#[derive(Deserialize)]
struct ChannelParams {
    channel: String,
}

pub fn handle_channels_status(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    Ok(json!({ "channels": state.channels.list(&scope_of(client)) }))
}

pub fn handle_channels_start(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: ChannelParams = parse_params(params)?;
    if parsed.channel.is_empty() {
        return Err(ErrorShape::invalid_request("channel is required"));
    }
    let entry = state
        .channels
        .set(&scope_of(client), &parsed.channel, ChannelStatus::Running);
    Ok(json!(entry))
}

pub fn handle_channels_stop(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: ChannelParams = parse_params(params)?;
    let entry = state
        .channels
        .set(&scope_of(client), &parsed.channel, ChannelStatus::Stopped);
    Ok(json!(entry))
}

/// Logout also clears any persisted channel credentials for the tenant.
pub fn handle_channels_logout(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: ChannelParams = parse_params(params)?;
    let scope = scope_of(client);
    if let Some(tenant_id) = client.auth.tenant_id.as_deref() {
        let creds = state
            .paths
            .tenant_dir(tenant_id)
            .join("credentials")
            .join(format!("{}.json", parsed.channel));
        let _ = std::fs::remove_file(creds);
    }
    let entry = state
        .channels
        .set(&scope, &parsed.channel, ChannelStatus::LoggedOut);
    Ok(json!(entry))
}
