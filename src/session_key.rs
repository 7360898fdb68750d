//! Session-key algebra.
//!
//! A session key names one logical multi-turn interaction. Keys owned by a
//! tenant always carry the canonical prefix `tenant:{tenantId}:`; keys built
//! for agents use `agent:{agentId}:{rest}`. Every tenant-originated key is
//! forced through [`scope_session_key_to_tenant`] before it reaches any
//! downstream component, so cross-tenant reuse of session state is impossible
//! by construction.
//!
//! Pure functions, no I/O.

/// Maximum length of a normalized agent id segment.
const AGENT_ID_MAX_LEN: usize = 64;

/// Fallback agent id when normalization leaves nothing usable.
const DEFAULT_AGENT_ID: &str = "main";

/// Default trailing segment for a tenant session key.
const DEFAULT_MAIN_KEY: &str = "main";

/// A parsed tenant-form session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSessionKey {
    pub tenant_id: String,
    pub agent_id: String,
    pub rest: String,
}

/// Normalize an agent id: invalid characters collapse to `-`, the result is
/// clipped to 64 chars, and an empty result falls back to `main`.
pub fn normalize_agent_id(agent_id: &str) -> String {
    let mut out = String::with_capacity(agent_id.len().min(AGENT_ID_MAX_LEN));
    for ch in agent_id.trim().to_ascii_lowercase().chars() {
        if out.len() >= AGENT_ID_MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            // Runs of invalid characters collapse to a single dash.
            if !out.ends_with('-') {
                out.push('-');
            }
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the canonical tenant session key
/// `tenant:{tenantId}:agent:{agentId}:{mainKey}`.
pub fn build_tenant_session_key(
    tenant_id: &str,
    agent_id: &str,
    main_key: Option<&str>,
) -> String {
    let tenant_id = tenant_id.to_ascii_lowercase();
    let agent_id = normalize_agent_id(agent_id);
    let rest = main_key.filter(|k| !k.is_empty()).unwrap_or(DEFAULT_MAIN_KEY);
    format!("tenant:{tenant_id}:agent:{agent_id}:{rest}")
}

/// Parse a tenant-form session key. Returns `None` unless the key starts with
/// `tenant:` and carries an interior `agent:{id}:` segment.
pub fn parse_tenant_session_key(key: &str) -> Option<TenantSessionKey> {
    let after_tenant = key.strip_prefix("tenant:")?;
    let (tenant_id, remainder) = after_tenant.split_once(':')?;
    if tenant_id.is_empty() {
        return None;
    }
    let after_agent = remainder.strip_prefix("agent:")?;
    let (agent_id, rest) = after_agent.split_once(':')?;
    if agent_id.is_empty() {
        return None;
    }
    Some(TenantSessionKey {
        tenant_id: tenant_id.to_string(),
        agent_id: agent_id.to_string(),
        rest: rest.to_string(),
    })
}

/// Force a session key into the authenticated tenant's namespace.
///
/// - No tenant context: the key passes through unchanged.
/// - Key already prefixed with the same tenant: unchanged.
/// - Key prefixed with a different tenant: error.
/// - Anything else gains the `tenant:{tenantId}:` prefix.
pub fn scope_session_key_to_tenant(
    session_key: &str,
    tenant_id: Option<&str>,
) -> Result<String, String> {
    let Some(tenant_id) = tenant_id else {
        return Ok(session_key.to_string());
    };
    if let Some(after) = session_key.strip_prefix("tenant:") {
        let owner = after.split(':').next().unwrap_or_default();
        if owner == tenant_id {
            return Ok(session_key.to_string());
        }
        return Err(format!(
            "session key tenant '{owner}' does not match authenticated tenant '{tenant_id}'"
        ));
    }
    Ok(format!("tenant:{tenant_id}:{session_key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults_to_main() {
        assert_eq!(
            build_tenant_session_key("Demo", "beta", None),
            "tenant:demo:agent:beta:main"
        );
        assert_eq!(
            build_tenant_session_key("demo", "beta", Some("openai:custom")),
            "tenant:demo:agent:beta:openai:custom"
        );
    }

    #[test]
    fn test_normalize_agent_id_collapses_invalid_chars() {
        assert_eq!(normalize_agent_id("My Agent!!"), "my-agent");
        assert_eq!(normalize_agent_id("___"), "___");
        assert_eq!(normalize_agent_id("??"), "main");
        assert_eq!(normalize_agent_id(""), "main");
        let long = "a".repeat(100);
        assert_eq!(normalize_agent_id(&long).len(), 64);
    }

    #[test]
    fn test_parse_tenant_session_key() {
        let parsed = parse_tenant_session_key("tenant:demo:agent:beta:openai:custom").unwrap();
        assert_eq!(parsed.tenant_id, "demo");
        assert_eq!(parsed.agent_id, "beta");
        assert_eq!(parsed.rest, "openai:custom");

        assert!(parse_tenant_session_key("agent:beta:main").is_none());
        assert!(parse_tenant_session_key("tenant:demo:main").is_none());
        assert!(parse_tenant_session_key("tenant::agent:beta:x").is_none());
    }

    #[test]
    fn test_scope_without_tenant_passes_through() {
        assert_eq!(
            scope_session_key_to_tenant("agent:beta:main", None).unwrap(),
            "agent:beta:main"
        );
    }

    #[test]
    fn test_scope_prefixes_foreign_keys() {
        assert_eq!(
            scope_session_key_to_tenant("agent:beta:openai:custom", Some("tenant-a")).unwrap(),
            "tenant:tenant-a:agent:beta:openai:custom"
        );
    }

    #[test]
    fn test_scope_is_idempotent() {
        let once = scope_session_key_to_tenant("agent:beta:main", Some("demo")).unwrap();
        let twice = scope_session_key_to_tenant(&once, Some("demo")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_scope_rejects_cross_tenant_keys() {
        let err = scope_session_key_to_tenant("tenant:other:agent:beta:main", Some("demo"))
            .unwrap_err();
        assert!(err.contains("does not match authenticated tenant"));
    }
}
