//! Agent records inside the tenant config overlay.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::session_key::normalize_agent_id;
use crate::settings;

use super::tenants::map_anyhow;
use super::{parse_params, tenant_scope};

fn load_agents(state: &GatewayState, tenant_id: &str) -> Result<(Value, Vec<Value>), ErrorShape> {
    let overlay = settings::load_overlay(&state.paths, tenant_id).map_err(map_anyhow)?;
    let agents = settings::agents(&overlay);
    Ok((overlay, agents))
}

fn store_agents(
    state: &GatewayState,
    tenant_id: &str,
    mut overlay: Value,
    agents: Vec<Value>,
) -> Result<(), ErrorShape> {
    settings::set_agents(&mut overlay, agents);
    settings::save_overlay(&state.paths, tenant_id, overlay).map_err(map_anyhow)?;
    Ok(())
}

pub fn handle_agents_list(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, None)?;
    let (overlay, agents) = load_agents(state, &tenant_id)?;
    Ok(json!({
        "agents": agents,
        "defaultAgent": settings::resolve_default_agent(&overlay),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentIdParams {
    agent_id: String,
}

pub fn handle_agents_get(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: AgentIdParams = parse_params(params)?;
    let (_, agents) = load_agents(state, &tenant_id)?;
    agents
        .into_iter()
        .find(|a| a.get("id").and_then(Value::as_str) == Some(parsed.agent_id.as_str()))
        .ok_or_else(|| ErrorShape::not_found(format!("agent '{}' not found", parsed.agent_id)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentCreateParams {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    /// Make this the tenant's default agent.
    #[serde(default)]
    default: bool,
}

pub fn handle_agents_create(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: AgentCreateParams = parse_params(params)?;
    let agent_id = normalize_agent_id(&parsed.id);

    let (mut overlay, mut agents) = load_agents(state, &tenant_id)?;
    if agents
        .iter()
        .any(|a| a.get("id").and_then(Value::as_str) == Some(agent_id.as_str()))
    {
        return Err(ErrorShape::invalid_request(format!(
            "agent '{agent_id}' already exists"
        )));
    }
    let agent = json!({
        "id": agent_id,
        "name": parsed.name,
        "model": parsed.model,
        "instructions": parsed.instructions,
    });
    agents.push(agent.clone());
    if parsed.default {
        if let Value::Object(map) = &mut overlay {
            map.insert("defaultAgent".to_string(), json!(agent_id));
        }
    }
    store_agents(state, &tenant_id, overlay, agents)?;
    Ok(agent)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentUpdateParams {
    agent_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

pub fn handle_agents_update(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: AgentUpdateParams = parse_params(params)?;
    let (overlay, mut agents) = load_agents(state, &tenant_id)?;
    let agent = agents
        .iter_mut()
        .find(|a| a.get("id").and_then(Value::as_str) == Some(parsed.agent_id.as_str()))
        .ok_or_else(|| ErrorShape::not_found(format!("agent '{}' not found", parsed.agent_id)))?;
    if let Value::Object(map) = agent {
        if let Some(name) = parsed.name {
            map.insert("name".to_string(), json!(name));
        }
        if let Some(model) = parsed.model {
            map.insert("model".to_string(), json!(model));
        }
        if let Some(instructions) = parsed.instructions {
            map.insert("instructions".to_string(), json!(instructions));
        }
    }
    let updated = agent.clone();
    store_agents(state, &tenant_id, overlay, agents)?;
    Ok(updated)
}

pub fn handle_agents_delete(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: AgentIdParams = parse_params(params)?;
    let (overlay, mut agents) = load_agents(state, &tenant_id)?;
    let before = agents.len();
    agents.retain(|a| a.get("id").and_then(Value::as_str) != Some(parsed.agent_id.as_str()));
    if agents.len() == before {
        return Err(ErrorShape::not_found(format!(
            "agent '{}' not found",
            parsed.agent_id
        )));
    }
    store_agents(state, &tenant_id, overlay, agents)?;
    Ok(json!({ "deleted": parsed.agent_id }))
}
