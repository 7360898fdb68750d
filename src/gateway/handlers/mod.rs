//! RPC handler families.

pub mod agents;
pub mod channels;
pub mod config;
pub mod cron;
pub mod misc;
pub mod pairing;
pub mod sessions;
pub mod skills;
pub mod tenants;
pub mod terminal;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::connections::ClientHandle;
use super::protocol::ErrorShape;

/// Deserialize a method's params, treating absent params as `{}`.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, ErrorShape> {
    let value = params.cloned().unwrap_or_else(|| json!({}));
    serde_json::from_value(value)
        .map_err(|err| ErrorShape::invalid_request(format!("invalid params: {err}")))
}

/// The authenticated tenant id, or `UNAUTHORIZED` for non-tenant callers.
pub(crate) fn require_tenant(client: &ClientHandle) -> Result<String, ErrorShape> {
    client
        .auth
        .tenant_id
        .clone()
        .ok_or_else(|| ErrorShape::unauthorized("method requires a tenant context"))
}

/// Tenant scope for methods admins may target at any tenant: tenant callers
/// are pinned to themselves, non-tenant admins must name one in params.
pub(crate) fn tenant_scope(
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<String, ErrorShape> {
    if let Some(own) = client.auth.tenant_id.clone() {
        return Ok(own);
    }
    params
        .and_then(|p| p.get("tenantId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ErrorShape::invalid_request("tenantId is required"))
}
