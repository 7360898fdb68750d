//! Tenant configuration overlay.
//!
//! Each tenant carries an `openclaw.json` overlay inside its state subtree.
//! The overlay never contains admin-only keys; they are stripped on every
//! write so a tenant can round-trip its own document safely. `config.patch`
//! applies an RFC 7396 style merge patch.

use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::paths::StatePaths;

/// Keys a tenant may never set or read through the config surface.
pub const ADMIN_ONLY_KEYS: [&str; 4] = ["quotas", "tokenHash", "disabled", "controlPlane"];

/// Fallback agent id when the overlay names none.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Load a tenant's overlay; a missing file is an empty object.
pub fn load_overlay(paths: &StatePaths, tenant_id: &str) -> Result<Value> {
    let path = paths.tenant_config(tenant_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(json!({})),
        Err(err) => return Err(err).context("reading tenant config overlay"),
    };
    serde_json::from_str(&raw).context("parsing tenant config overlay")
}

/// Persist a tenant's overlay with admin-only keys stripped.
pub fn save_overlay(paths: &StatePaths, tenant_id: &str, mut overlay: Value) -> Result<Value> {
    strip_admin_keys(&mut overlay);
    let path = paths.tenant_config(tenant_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("creating tenant dir")?;
    }
    let json = serde_json::to_string_pretty(&overlay).context("serializing overlay")?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(overlay)
}

/// Apply an RFC 7396 merge patch and persist the result.
pub fn patch_overlay(paths: &StatePaths, tenant_id: &str, patch: Value) -> Result<Value> {
    let base = load_overlay(paths, tenant_id)?;
    let merged = merge_patch(base, patch);
    save_overlay(paths, tenant_id, merged)
}

fn strip_admin_keys(overlay: &mut Value) {
    if let Value::Object(map) = overlay {
        for key in ADMIN_ONLY_KEYS {
            map.remove(key);
        }
    }
}

/// RFC 7396 merge-patch semantics: null removes, objects merge recursively,
/// everything else replaces.
pub fn merge_patch(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(&key);
                } else {
                    let base_value = base_map.remove(&key).unwrap_or(Value::Null);
                    base_map.insert(key, merge_patch(base_value, patch_value));
                }
            }
            Value::Object(base_map)
        }
        (_, patch_value) => patch_value,
    }
}

/// Resolve a tenant's default agent id from its overlay: the explicit
/// `defaultAgent`, else the first declared agent, else `main`.
pub fn resolve_default_agent(overlay: &Value) -> String {
    if let Some(id) = overlay.get("defaultAgent").and_then(Value::as_str) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(first) = overlay
        .get("agents")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(|a| a.get("id"))
        .and_then(Value::as_str)
    {
        return first.to_string();
    }
    DEFAULT_AGENT_ID.to_string()
}

/// Agent records kept inside the overlay's `agents` array.
pub fn agents(overlay: &Value) -> Vec<Value> {
    overlay
        .get("agents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub fn set_agents(overlay: &mut Value, agents: Vec<Value>) {
    if !overlay.is_object() {
        *overlay = json!({});
    }
    if let Value::Object(map) = overlay {
        map.insert("agents".to_string(), Value::Array(agents));
    }
}

/// Static JSON schema describing the tenant-settable overlay keys, served by
/// `config.schema`.
pub fn overlay_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "defaultAgent": { "type": "string" },
            "agents": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id"],
                    "properties": {
                        "id": { "type": "string" },
                        "name": { "type": "string" },
                        "model": { "type": "string" },
                        "instructions": { "type": "string" }
                    }
                }
            },
            "voicewake": {
                "type": "object",
                "properties": {
                    "enabled": { "type": "boolean" },
                    "phrases": { "type": "array", "items": { "type": "string" } }
                }
            },
            "channels": { "type": "object" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_merge_patch_semantics() {
        let base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let patch = json!({"a": {"b": null, "e": 9}, "d": 4});
        let merged = merge_patch(base, patch);
        assert_eq!(merged, json!({"a": {"c": 2, "e": 9}, "d": 4}));
    }

    #[test]
    fn test_merge_patch_replaces_non_objects() {
        assert_eq!(merge_patch(json!([1, 2]), json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_patch(json!({"a": 1}), json!(7)), json!(7));
    }

    #[test]
    fn test_save_strips_admin_keys() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let saved = save_overlay(
            &paths,
            "demo",
            json!({"defaultAgent": "beta", "quotas": {"monthlyTokens": 1}, "disabled": true}),
        )
        .unwrap();
        assert_eq!(saved, json!({"defaultAgent": "beta"}));
        let loaded = load_overlay(&paths, "demo").unwrap();
        assert!(loaded.get("quotas").is_none());
    }

    #[test]
    fn test_resolve_default_agent_fallbacks() {
        assert_eq!(resolve_default_agent(&json!({})), "main");
        assert_eq!(
            resolve_default_agent(&json!({"agents": [{"id": "beta"}]})),
            "beta"
        );
        assert_eq!(
            resolve_default_agent(&json!({"defaultAgent": "alpha", "agents": [{"id": "beta"}]})),
            "alpha"
        );
    }
}
