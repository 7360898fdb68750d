//! Device and node pairing registries.
//!
//! Devices appear as pending entries when an unpaired client attempts a
//! connect handshake; an operator with the pairing scope approves or rejects
//! them. Nodes request pairing explicitly and verify with a short code.
//! Issued tokens are stored as hashes only, verified in constant time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::tenant::token::{hash_secret, verify_secret};

use super::parse_params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub status: PairStatus,
    #[serde(skip)]
    pub token_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    pub name: String,
    pub status: PairStatus,
    #[serde(skip)]
    pub code: String,
    #[serde(skip)]
    pub token_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// In-memory pairing state.
#[derive(Clone, Default)]
pub struct PairingRegistry {
    devices: Arc<DashMap<String, DeviceRecord>>,
    nodes: Arc<DashMap<String, NodeRecord>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an unpaired client as a pending device.
    pub fn request_device(&self, name: &str) -> DeviceRecord {
        let record = DeviceRecord {
            device_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: PairStatus::Pending,
            token_hash: None,
            requested_at: Utc::now(),
            approved_at: None,
        };
        self.devices.insert(record.device_id.clone(), record.clone());
        record
    }

    fn issue_device_token(&self, device_id: &str) -> Result<String, ErrorShape> {
        let mut entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ErrorShape::not_found(format!("device '{device_id}' not found")))?;
        let token = Uuid::new_v4().to_string();
        entry.token_hash = Some(hash_secret(&token));
        entry.status = PairStatus::Approved;
        entry.approved_at = Some(Utc::now());
        Ok(token)
    }

    /// Node pairing request; returns the record plus a 6-digit verify code.
    pub fn request_node(&self, name: &str) -> NodeRecord {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let record = NodeRecord {
            node_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: PairStatus::Pending,
            code,
            token_hash: None,
            requested_at: Utc::now(),
        };
        self.nodes.insert(record.node_id.clone(), record.clone());
        record
    }

    /// Authenticate a node connection by its issued token.
    pub fn authenticate_node(&self, token: &str) -> Option<NodeRecord> {
        self.nodes
            .iter()
            .find(|entry| {
                entry.status == PairStatus::Approved
                    && entry
                        .token_hash
                        .as_deref()
                        .map(|hash| verify_secret(token, hash))
                        .unwrap_or(false)
            })
            .map(|entry| entry.clone())
    }
}

pub fn handle_device_pair_list(state: &GatewayState) -> Result<Value, ErrorShape> {
    let mut devices: Vec<DeviceRecord> =
        state.pairing.devices.iter().map(|e| e.clone()).collect();
    devices.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
    Ok(json!({ "devices": devices }))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceIdParams {
    device_id: String,
}

pub fn handle_device_pair_approve(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: DeviceIdParams = parse_params(params)?;
    let token = state.pairing.issue_device_token(&parsed.device_id)?;
    Ok(json!({ "deviceId": parsed.device_id, "token": token }))
}

pub fn handle_device_pair_reject(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: DeviceIdParams = parse_params(params)?;
    state
        .pairing
        .devices
        .remove(&parsed.device_id)
        .ok_or_else(|| ErrorShape::not_found(format!("device '{}' not found", parsed.device_id)))?;
    Ok(json!({ "rejected": parsed.device_id }))
}

pub fn handle_device_token_rotate(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: DeviceIdParams = parse_params(params)?;
    let token = state.pairing.issue_device_token(&parsed.device_id)?;
    Ok(json!({ "deviceId": parsed.device_id, "token": token }))
}

pub fn handle_device_token_revoke(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: DeviceIdParams = parse_params(params)?;
    let mut entry = state
        .pairing
        .devices
        .get_mut(&parsed.device_id)
        .ok_or_else(|| ErrorShape::not_found(format!("device '{}' not found", parsed.device_id)))?;
    entry.token_hash = None;
    Ok(json!({ "revoked": parsed.device_id }))
}

#[derive(serde::Deserialize)]
struct NodeRequestParams {
    name: String,
}

pub fn handle_node_pair_request(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeRequestParams = parse_params(params)?;
    let record = state.pairing.request_node(&parsed.name);
    Ok(json!({ "nodeId": record.node_id, "code": record.code }))
}

pub fn handle_node_pair_list(state: &GatewayState) -> Result<Value, ErrorShape> {
    let mut nodes: Vec<NodeRecord> = state.pairing.nodes.iter().map(|e| e.clone()).collect();
    nodes.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
    Ok(json!({ "nodes": nodes }))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeIdParams {
    node_id: String,
}

pub fn handle_node_pair_approve(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeIdParams = parse_params(params)?;
    let mut entry = state
        .pairing
        .nodes
        .get_mut(&parsed.node_id)
        .ok_or_else(|| ErrorShape::not_found(format!("node '{}' not found", parsed.node_id)))?;
    let token = Uuid::new_v4().to_string();
    entry.token_hash = Some(hash_secret(&token));
    entry.status = PairStatus::Approved;
    Ok(json!({ "nodeId": parsed.node_id, "token": token }))
}

pub fn handle_node_pair_reject(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeIdParams = parse_params(params)?;
    state
        .pairing
        .nodes
        .remove(&parsed.node_id)
        .ok_or_else(|| ErrorShape::not_found(format!("node '{}' not found", parsed.node_id)))?;
    Ok(json!({ "rejected": parsed.node_id }))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeVerifyParams {
    node_id: String,
    code: String,
}

pub fn handle_node_pair_verify(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeVerifyParams = parse_params(params)?;
    let entry = state
        .pairing
        .nodes
        .get(&parsed.node_id)
        .ok_or_else(|| ErrorShape::not_found(format!("node '{}' not found", parsed.node_id)))?;
    Ok(json!({ "verified": entry.code == parsed.code }))
}

pub fn handle_node_list(state: &GatewayState) -> Result<Value, ErrorShape> {
    let nodes: Vec<NodeRecord> = state
        .pairing
        .nodes
        .iter()
        .filter(|e| e.status == PairStatus::Approved)
        .map(|e| e.clone())
        .collect();
    Ok(json!({ "nodes": nodes }))
}

pub fn handle_node_describe(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeIdParams = parse_params(params)?;
    let entry = state
        .pairing
        .nodes
        .get(&parsed.node_id)
        .ok_or_else(|| ErrorShape::not_found(format!("node '{}' not found", parsed.node_id)))?;
    Ok(json!(entry.clone()))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRenameParams {
    node_id: String,
    name: String,
}

pub fn handle_node_rename(
    state: &GatewayState,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: NodeRenameParams = parse_params(params)?;
    let mut entry = state
        .pairing
        .nodes
        .get_mut(&parsed.node_id)
        .ok_or_else(|| ErrorShape::not_found(format!("node '{}' not found", parsed.node_id)))?;
    entry.name = parsed.name.clone();
    Ok(json!({ "nodeId": parsed.node_id, "name": parsed.name }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_pairing_flow() {
        let registry = PairingRegistry::new();
        let pending = registry.request_device("laptop");
        assert_eq!(pending.status, PairStatus::Pending);

        let token = registry.issue_device_token(&pending.device_id).unwrap();
        let record = registry.devices.get(&pending.device_id).unwrap().clone();
        assert_eq!(record.status, PairStatus::Approved);
        assert!(verify_secret(&token, record.token_hash.as_deref().unwrap()));
        assert!(registry.issue_device_token("missing").is_err());
    }

    #[test]
    fn test_node_token_authentication() {
        let registry = PairingRegistry::new();
        let node = registry.request_node("builder");
        assert!(registry.authenticate_node("anything").is_none());

        let token = {
            let mut entry = registry.nodes.get_mut(&node.node_id).unwrap();
            let token = Uuid::new_v4().to_string();
            entry.token_hash = Some(hash_secret(&token));
            entry.status = PairStatus::Approved;
            token
        };
        let authed = registry.authenticate_node(&token).unwrap();
        assert_eq!(authed.node_id, node.node_id);
        assert!(registry.authenticate_node("wrong-token").is_none());
    }
}
