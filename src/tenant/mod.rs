//! Tenant identity: records, tokens, and the persisted registry.

mod registry;
pub mod token;

pub use registry::{TenantRegistry, REGISTRY_VERSION};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-tenant resource caps. Absent fields mean unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantQuotas {
    /// Hard monthly token cap; requests are denied once crossed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_tokens: Option<u64>,
    /// Soft monthly token cap; crossing attaches a warning only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_tokens_soft: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost_cents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost_cents_soft: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_sessions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_cpu_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_disk_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_pids: Option<u32>,
}

/// One persisted tenant record. The plaintext secret never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEntry {
    /// Hex-encoded SHA-256 of the token secret.
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TenantQuotas>,
}

/// Authenticated tenant context resolved from a validated token.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    /// Root of this tenant's isolated state subtree.
    pub state_dir: PathBuf,
    pub display_name: Option<String>,
    pub quotas: Option<TenantQuotas>,
}

/// Selective field update for [`TenantRegistry::update`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantUpdate {
    pub display_name: Option<String>,
    pub disabled: Option<bool>,
    pub quotas: Option<TenantQuotas>,
}
