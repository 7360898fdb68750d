//! Per-call method authorization.
//!
//! Checks run in a fixed order; the tenant allow-list rail (step 3) is the
//! load-bearing one: a tenant-authenticated connection can never reach a
//! method outside the enumerated set, no matter which scopes it holds.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::protocol::{ErrorCode, ErrorShape};

/// Connection roles accepted at the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Operator,
    Node,
}

/// The slice of a connection the authorizer consults.
#[derive(Debug, Clone, Default)]
pub struct ConnectionAuth {
    /// No role means the handshake did not present one; authorization fails
    /// closed rather than assuming operator.
    pub role: Option<Role>,
    pub scopes: Vec<String>,
    pub tenant_id: Option<String>,
}

impl ConnectionAuth {
    pub fn is_admin(&self) -> bool {
        scope_satisfies(&self.scopes, "operator.admin")
    }
}

/// Methods only a node connection may call.
pub const NODE_ONLY_METHODS: [&str; 3] = ["node.invoke.result", "node.event", "skills.bins"];

/// Every method a tenant-authenticated connection may invoke. Anything else
/// is rejected outright for tenant tokens, even with admin scope.
pub const TENANT_ALLOWED_METHODS: [&str; 57] = [
    "health",
    // Terminal verbs.
    "terminal.spawn",
    "terminal.write",
    "terminal.resize",
    "terminal.close",
    "terminal.list",
    // Tenant self-management.
    "tenant.get",
    "tenant.rotate",
    "tenant.backup",
    "tenant.backups.list",
    "tenant.restore",
    "tenant.delete",
    "tenant.usage",
    "tenant.quota.status",
    "tenant.usage.history",
    // Config overlay.
    "config.get",
    "config.set",
    "config.patch",
    "config.schema",
    // Agent CRUD.
    "agents.list",
    "agents.get",
    "agents.create",
    "agents.update",
    "agents.delete",
    // Sessions, read-only subset.
    "sessions.list",
    "sessions.preview",
    // Cron CRUD plus run.
    "cron.status",
    "cron.list",
    "cron.runs",
    "cron.add",
    "cron.update",
    "cron.remove",
    "cron.run",
    // Skills.
    "skills.status",
    "skills.list",
    "skills.install",
    "skills.update",
    "skills.remove",
    // Channels.
    "channels.start",
    "channels.stop",
    "channels.logout",
    "channels.status",
    // Voice wake.
    "voicewake.get",
    "voicewake.set",
    // Device pairing.
    "device.pair.list",
    "device.pair.approve",
    "device.pair.reject",
    "device.token.rotate",
    "device.token.revoke",
    // Node pairing.
    "node.pair.request",
    "node.pair.list",
    "node.pair.approve",
    "node.pair.reject",
    "node.pair.verify",
    "node.list",
    "node.describe",
    "node.rename",
];

/// Methods requiring `operator.pairing` (or admin).
const PAIRING_METHODS: [&str; 9] = [
    "device.pair.approve",
    "device.pair.reject",
    "device.token.rotate",
    "device.token.revoke",
    "node.pair.request",
    "node.pair.approve",
    "node.pair.reject",
    "node.pair.verify",
    "node.rename",
];

/// Methods requiring `operator.approvals` (or admin).
const APPROVAL_METHODS: [&str; 2] = ["exec.approvals.get", "exec.approvals.set"];

/// Name prefixes that always require admin scope, whatever else matched.
const ADMIN_PREFIXES: [&str; 3] = ["tenants.", "wizard.", "update."];

/// Required access level for a method, before scope checks.
fn method_access(method: &str) -> &'static str {
    match method {
        "health"
        | "status"
        | "tenant.get"
        | "tenant.usage"
        | "tenant.usage.history"
        | "tenant.quota.status"
        | "tenant.backups.list"
        | "config.get"
        | "config.schema"
        | "agents.list"
        | "agents.get"
        | "sessions.list"
        | "sessions.preview"
        | "cron.status"
        | "cron.list"
        | "cron.runs"
        | "skills.status"
        | "skills.list"
        | "channels.status"
        | "voicewake.get"
        | "device.pair.list"
        | "node.pair.list"
        | "node.list"
        | "node.describe"
        | "exec.approvals.get" => "read",

        "terminal.spawn" | "terminal.write" | "terminal.resize" | "terminal.close"
        | "terminal.list" | "tenant.rotate" | "tenant.backup" | "tenant.restore"
        | "tenant.delete" | "config.set" | "config.patch" | "agents.create"
        | "agents.update" | "agents.delete" | "cron.add" | "cron.update" | "cron.remove"
        | "cron.run" | "skills.install" | "skills.update" | "skills.remove"
        | "channels.start" | "channels.stop" | "channels.logout" | "voicewake.set"
        | "device.pair.approve" | "device.pair.reject" | "device.token.rotate"
        | "device.token.revoke" | "node.pair.request" | "node.pair.approve"
        | "node.pair.reject" | "node.pair.verify" | "node.rename"
        | "exec.approvals.set" => "write",

        // Unknown methods fail secure.
        _ => "admin",
    }
}

/// Scope satisfaction with the operator wildcard/implication rules.
pub fn scope_satisfies(scopes: &[String], required: &str) -> bool {
    scopes.iter().any(|scope| {
        scope == required
            || (scope == "operator.*" && required.starts_with("operator."))
            || (scope == "operator.admin" && required.starts_with("operator."))
            || (scope == "operator.write" && required == "operator.read")
    })
}

fn forbidden(method: &str, required_scope: &str, auth: &ConnectionAuth) -> ErrorShape {
    ErrorShape::unauthorized(format!("method '{method}' requires '{required_scope}' scope"))
        .with_details(json!({
            "method": method,
            "requiredScope": required_scope,
            "connectionScopes": auth.scopes,
        }))
}

/// Authorize one method call for one connection.
///
/// Order of checks:
/// 1. node-only method set for node roles, nothing else;
/// 2. anything without the operator role is rejected;
/// 3. tenant connections are confined to [`TENANT_ALLOWED_METHODS`];
/// 4. admin scope passes;
/// 5. pairing/approval sets need their specific scope;
/// 6. read methods need read-or-write, write methods need write;
/// 7. admin-prefixed names always need admin scope.
pub fn authorize(method: &str, auth: &ConnectionAuth) -> Result<(), ErrorShape> {
    match auth.role {
        Some(Role::Node) => {
            if NODE_ONLY_METHODS.contains(&method) {
                return Ok(());
            }
            return Err(ErrorShape::unauthorized(format!(
                "method '{method}' not allowed for node role"
            )));
        }
        Some(Role::Operator) => {}
        None => {
            return Err(ErrorShape::unauthorized(
                "connection has no role; operator role required",
            ));
        }
    }
    if NODE_ONLY_METHODS.contains(&method) {
        return Err(ErrorShape::unauthorized(format!(
            "method '{method}' is only allowed for node role"
        )));
    }

    // The tenant rail: applies before any scope can widen access.
    if auth.tenant_id.is_some() && !TENANT_ALLOWED_METHODS.contains(&method) {
        return Err(ErrorShape::new(
            ErrorCode::InvalidRequest,
            format!("method '{method}' not available for tenant token"),
        ));
    }

    if auth.is_admin() {
        return Ok(());
    }

    if PAIRING_METHODS.contains(&method) {
        if scope_satisfies(&auth.scopes, "operator.pairing") {
            return Ok(());
        }
        return Err(forbidden(method, "operator.pairing", auth));
    }
    if APPROVAL_METHODS.contains(&method) {
        if scope_satisfies(&auth.scopes, "operator.approvals") {
            return Ok(());
        }
        return Err(forbidden(method, "operator.approvals", auth));
    }

    if ADMIN_PREFIXES.iter().any(|p| method.starts_with(p)) {
        return Err(forbidden(method, "operator.admin", auth));
    }

    match method_access(method) {
        "read" => {
            if scope_satisfies(&auth.scopes, "operator.read") {
                Ok(())
            } else {
                Err(forbidden(method, "operator.read", auth))
            }
        }
        "write" => {
            if scope_satisfies(&auth.scopes, "operator.write") {
                Ok(())
            } else {
                Err(forbidden(method, "operator.write", auth))
            }
        }
        _ => Err(forbidden(method, "operator.admin", auth)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(scopes: &[&str]) -> ConnectionAuth {
        ConnectionAuth {
            role: Some(Role::Operator),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            tenant_id: None,
        }
    }

    fn tenant(scopes: &[&str]) -> ConnectionAuth {
        ConnectionAuth {
            tenant_id: Some("tenant-a".to_string()),
            ..operator(scopes)
        }
    }

    #[test]
    fn test_missing_role_fails_closed() {
        let auth = ConnectionAuth {
            role: None,
            scopes: vec!["operator.admin".to_string()],
            tenant_id: None,
        };
        assert!(authorize("health", &auth).is_err());
    }

    #[test]
    fn test_node_role_confined_to_node_methods() {
        let node = ConnectionAuth {
            role: Some(Role::Node),
            scopes: Vec::new(),
            tenant_id: None,
        };
        assert!(authorize("node.event", &node).is_ok());
        assert!(authorize("health", &node).is_err());
        // And nobody else may call node-only methods.
        assert!(authorize("node.event", &operator(&["operator.admin"])).is_err());
    }

    #[test]
    fn test_tenant_rail_rejects_outside_allow_list() {
        for method in ["wizard.start", "status", "tenants.create", "exec.approvals.set"] {
            let err = authorize(
                method,
                &tenant(&["operator.read", "operator.write", "operator.admin"]),
            )
            .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest, "method {method}");
            assert!(
                err.message.contains("not available for tenant token"),
                "method {method}: {}",
                err.message
            );
        }
    }

    #[test]
    fn test_tenant_allowed_methods_pass_with_scopes() {
        let auth = tenant(&["operator.read", "operator.write"]);
        for method in ["health", "terminal.spawn", "cron.add", "sessions.list"] {
            assert!(authorize(method, &auth).is_ok(), "method {method}");
        }
    }

    #[test]
    fn test_read_scope_cannot_write() {
        let auth = operator(&["operator.read"]);
        assert!(authorize("sessions.list", &auth).is_ok());
        assert!(authorize("cron.add", &auth).is_err());
    }

    #[test]
    fn test_write_scope_implies_read() {
        let auth = operator(&["operator.write"]);
        assert!(authorize("sessions.list", &auth).is_ok());
        assert!(authorize("cron.add", &auth).is_ok());
    }

    #[test]
    fn test_pairing_needs_specific_scope() {
        assert!(authorize("device.pair.approve", &operator(&["operator.write"])).is_err());
        assert!(authorize("device.pair.approve", &operator(&["operator.pairing"])).is_ok());
        assert!(authorize("device.pair.approve", &operator(&["operator.admin"])).is_ok());
    }

    #[test]
    fn test_admin_prefixes_require_admin() {
        assert!(authorize("tenants.create", &operator(&["operator.write"])).is_err());
        assert!(authorize("tenants.create", &operator(&["operator.admin"])).is_ok());
        assert!(authorize("wizard.start", &operator(&["operator.*"])).is_ok());
    }

    #[test]
    fn test_unknown_method_fails_secure() {
        assert!(authorize("no.such.method", &operator(&["operator.write"])).is_err());
        assert!(authorize("no.such.method", &operator(&["operator.admin"])).is_ok());
    }
}
