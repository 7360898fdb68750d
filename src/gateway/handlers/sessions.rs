//! Read-only session listing and preview.
//!
//! Session transcripts are written by the agent pipeline under
//! `tenants/{id}/agents/{agentId}/sessions/`; the gateway only lists and
//! tails them. Keys presented by clients go through the session-key algebra,
//! so a tenant can never preview another tenant's transcript.

use std::fs;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::session_key::{parse_tenant_session_key, scope_session_key_to_tenant};

use super::{parse_params, tenant_scope};

/// Lines returned by a preview.
const PREVIEW_LINES: usize = 20;

/// Key segments become file names under the sessions directory. Anything
/// that could traverse out of it is rejected before any path is built.
fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains('/')
        && !segment.contains('\\')
        && !segment.contains("..")
}

pub fn handle_sessions_list(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let tenant_id = tenant_scope(client, params)?;
    let agents_dir = state.paths.tenant_agents_dir(&tenant_id);
    let mut sessions = Vec::new();

    let agent_entries = match fs::read_dir(&agents_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(json!({ "sessions": [] })),
    };
    for agent_entry in agent_entries.flatten() {
        if !agent_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let agent_id = agent_entry.file_name().to_string_lossy().to_string();
        let sessions_dir = state.paths.tenant_sessions_dir(&tenant_id, &agent_id);
        let Ok(files) = fs::read_dir(&sessions_dir) else {
            continue;
        };
        for file in files.flatten() {
            let Ok(meta) = file.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let name = file.file_name().to_string_lossy().to_string();
            let stem = name
                .strip_suffix(".jsonl")
                .or_else(|| name.strip_suffix(".json"))
                .unwrap_or(&name);
            let updated_at = meta.modified().ok().map(DateTime::<Utc>::from);
            sessions.push(json!({
                "sessionKey": format!("tenant:{tenant_id}:agent:{agent_id}:{stem}"),
                "agentId": agent_id,
                "sizeBytes": meta.len(),
                "updatedAt": updated_at,
            }));
        }
    }
    Ok(json!({ "sessions": sessions }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewParams {
    session_key: String,
    #[serde(default)]
    lines: Option<usize>,
}

pub fn handle_sessions_preview(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: PreviewParams = parse_params(params)?;

    // Tenant callers have the key forced into their own namespace first.
    let scoped = scope_session_key_to_tenant(
        &parsed.session_key,
        client.auth.tenant_id.as_deref(),
    )
    .map_err(ErrorShape::unauthorized)?;
    let key = parse_tenant_session_key(&scoped)
        .ok_or_else(|| ErrorShape::invalid_request("sessionKey is not a tenant session key"))?;
    if !is_safe_segment(&key.agent_id) || !is_safe_segment(&key.rest) {
        return Err(ErrorShape::invalid_request(
            "sessionKey segments must not contain path separators or '..'",
        ));
    }

    let sessions_dir = state
        .paths
        .tenant_sessions_dir(&key.tenant_id, &key.agent_id);
    let candidates = [
        sessions_dir.join(format!("{}.jsonl", key.rest)),
        sessions_dir.join(format!("{}.json", key.rest)),
        sessions_dir.join(&key.rest),
    ];
    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ErrorShape::not_found(format!("no session '{scoped}'")))?;

    let raw = fs::read_to_string(path)
        .map_err(|err| ErrorShape::unavailable(format!("reading session: {err}")))?;
    let lines = parsed.lines.unwrap_or(PREVIEW_LINES);
    let tail: Vec<&str> = raw.lines().rev().take(lines).collect();
    let preview: Vec<&str> = tail.into_iter().rev().collect();
    Ok(json!({
        "sessionKey": scoped,
        "lines": preview,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_segments() {
        assert!(is_safe_segment("openai:custom"));
        assert!(is_safe_segment("chat-1"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment("a..b"));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("../../../../etc/passwd"));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment("a\\b"));
    }
}
