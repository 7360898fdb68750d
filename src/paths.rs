//! State-directory layout.
//!
//! Everything the gateway persists lives under a single configured state
//! directory:
//!
//! ```text
//! tenants.json                 # tenant registry (mode 0600)
//! metrics/system-current.json
//! metrics/system-hourly/<h>.json
//! tenants/{tenantId}/
//!   openclaw.json              # tenant config overlay
//!   workspace/
//!   agents/{agentId}/sessions/
//!   memory/
//!   plugins/
//!   sandboxes/
//!   credentials/
//!   cron/jobs.json
//!   usage/current.json
//!   usage/{YYYY-MM}.json
//!   usage/rate-limits.json
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Subdirectories created for every new tenant.
pub const TENANT_SUBDIRS: [&str; 6] = [
    "workspace",
    "agents",
    "memory",
    "plugins",
    "sandboxes",
    "credentials",
];

/// Resolved paths under the gateway state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The single-file tenant registry document.
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("tenants.json")
    }

    pub fn metrics_current(&self) -> PathBuf {
        self.root.join("metrics").join("system-current.json")
    }

    pub fn metrics_hourly(&self, hour_label: &str) -> PathBuf {
        self.root
            .join("metrics")
            .join("system-hourly")
            .join(format!("{hour_label}.json"))
    }

    /// Root of one tenant's isolated state subtree.
    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.root.join("tenants").join(tenant_id)
    }

    pub fn tenant_config(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("openclaw.json")
    }

    pub fn tenant_workspace(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("workspace")
    }

    pub fn tenant_agents_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("agents")
    }

    pub fn tenant_sessions_dir(&self, tenant_id: &str, agent_id: &str) -> PathBuf {
        self.tenant_agents_dir(tenant_id)
            .join(agent_id)
            .join("sessions")
    }

    pub fn tenant_memory_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("memory")
    }

    pub fn tenant_cron_jobs(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("cron").join("jobs.json")
    }

    pub fn tenant_cron_run_log(&self, tenant_id: &str, job_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join("cron")
            .join(format!("runs-{job_id}.jsonl"))
    }

    /// Global (non-tenant) scheduled-job store.
    pub fn global_cron_jobs(&self) -> PathBuf {
        self.root.join("cron").join("jobs.json")
    }

    pub fn global_cron_run_log(&self, job_id: &str) -> PathBuf {
        self.root.join("cron").join(format!("runs-{job_id}.jsonl"))
    }

    pub fn tenant_usage_current(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("usage").join("current.json")
    }

    pub fn tenant_usage_archive(&self, tenant_id: &str, period: &str) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join("usage")
            .join(format!("{period}.json"))
    }

    pub fn tenant_rate_limits(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join("usage")
            .join("rate-limits.json")
    }

    pub fn tenant_skills(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("plugins").join("skills.json")
    }

    /// Create the full directory tree for a freshly registered tenant.
    pub fn init_tenant_tree(&self, tenant_id: &str) -> Result<()> {
        let dir = self.tenant_dir(tenant_id);
        for sub in TENANT_SUBDIRS {
            std::fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("creating {sub} dir for tenant {tenant_id}"))?;
        }
        std::fs::create_dir_all(dir.join("cron")).context("creating cron dir")?;
        std::fs::create_dir_all(dir.join("usage")).context("creating usage dir")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let paths = StatePaths::new("/var/lib/clawgate");
        assert_eq!(
            paths.registry_file(),
            PathBuf::from("/var/lib/clawgate/tenants.json")
        );
        assert_eq!(
            paths.tenant_usage_archive("demo", "2026-07"),
            PathBuf::from("/var/lib/clawgate/tenants/demo/usage/2026-07.json")
        );
        assert_eq!(
            paths.tenant_cron_jobs("demo"),
            PathBuf::from("/var/lib/clawgate/tenants/demo/cron/jobs.json")
        );
    }

    #[test]
    fn test_init_tenant_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        paths.init_tenant_tree("demo").unwrap();
        assert!(paths.tenant_workspace("demo").is_dir());
        assert!(paths.tenant_dir("demo").join("credentials").is_dir());
        assert!(paths.tenant_dir("demo").join("usage").is_dir());
    }
}
