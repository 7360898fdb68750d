//! Per-tenant skill records.
//!
//! Skills are declarative records in a JSON store under the tenant's plugins
//! directory; actual skill content is delivered out of band.

use std::fs;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;

use super::{parse_params, tenant_scope};

fn load_skills(state: &GatewayState, tenant_id: &str) -> Vec<Value> {
    let path = state.paths.tenant_skills(tenant_id);
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_skills(
    state: &GatewayState,
    tenant_id: &str,
    skills: &[Value],
) -> Result<(), ErrorShape> {
    let path = state.paths.tenant_skills(tenant_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ErrorShape::unavailable(format!("skills store: {err}")))?;
    }
    let json = serde_json::to_string_pretty(skills)
        .map_err(|err| ErrorShape::unavailable(format!("skills store: {err}")))?;
    fs::write(&path, json)
        .map_err(|err| ErrorShape::unavailable(format!("skills store: {err}")))?;
    Ok(())
}

pub fn handle_skills_status(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, None)?;
    let skills = load_skills(state, &tenant_id);
    Ok(json!({
        "count": skills.len(),
        "names": skills
            .iter()
            .filter_map(|s| s.get("name").and_then(Value::as_str))
            .collect::<Vec<_>>(),
    }))
}

pub fn handle_skills_list(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, None)?;
    Ok(json!({ "skills": load_skills(state, &tenant_id) }))
}

#[derive(Deserialize)]
struct SkillInstallParams {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

pub fn handle_skills_install(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: SkillInstallParams = parse_params(params)?;
    if parsed.name.is_empty() {
        return Err(ErrorShape::invalid_request("skill name is required"));
    }
    let mut skills = load_skills(state, &tenant_id);
    if skills
        .iter()
        .any(|s| s.get("name").and_then(Value::as_str) == Some(parsed.name.as_str()))
    {
        return Err(ErrorShape::invalid_request(format!(
            "skill '{}' already installed",
            parsed.name
        )));
    }
    let skill = json!({
        "name": parsed.name,
        "version": parsed.version.unwrap_or_else(|| "latest".to_string()),
        "enabled": true,
        "installedAt": Utc::now(),
    });
    skills.push(skill.clone());
    save_skills(state, &tenant_id, &skills)?;
    Ok(skill)
}

#[derive(Deserialize)]
struct SkillUpdateParams {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

pub fn handle_skills_update(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: SkillUpdateParams = parse_params(params)?;
    let mut skills = load_skills(state, &tenant_id);
    let skill = skills
        .iter_mut()
        .find(|s| s.get("name").and_then(Value::as_str) == Some(parsed.name.as_str()))
        .ok_or_else(|| ErrorShape::not_found(format!("skill '{}' not found", parsed.name)))?;
    if let Value::Object(map) = skill {
        if let Some(version) = parsed.version {
            map.insert("version".to_string(), json!(version));
        }
        if let Some(enabled) = parsed.enabled {
            map.insert("enabled".to_string(), json!(enabled));
        }
        map.insert("updatedAt".to_string(), json!(Utc::now()));
    }
    let updated = skill.clone();
    save_skills(state, &tenant_id, &skills)?;
    Ok(updated)
}

#[derive(Deserialize)]
struct SkillRemoveParams {
    name: String,
}

pub fn handle_skills_remove(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let parsed: SkillRemoveParams = parse_params(params)?;
    let mut skills = load_skills(state, &tenant_id);
    let before = skills.len();
    skills.retain(|s| s.get("name").and_then(Value::as_str) != Some(parsed.name.as_str()));
    if skills.len() == before {
        return Err(ErrorShape::not_found(format!(
            "skill '{}' not found",
            parsed.name
        )));
    }
    save_skills(state, &tenant_id, &skills)?;
    Ok(json!({ "removed": parsed.name }))
}
