//! Native recursive disk sizing with a short-lived cache.
//!
//! Walking a tenant's subtree is slow, so it never happens on a request hot
//! path: only an explicit refresh (admin or tenant initiated) recomputes, and
//! results are cached for 30 seconds.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::paths::StatePaths;

/// How long a computed decomposition stays fresh.
pub const DISK_CACHE_TTL: Duration = Duration::from_secs(30);

/// Disk consumption decomposed the way the usage snapshot reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub workspace_bytes: u64,
    pub agent_data_bytes: u64,
    pub memory_bytes: u64,
}

/// Recursive byte size of a directory tree. Symlinks are not followed.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    total
}

/// TTL cache of per-tenant disk decompositions.
#[derive(Clone)]
pub struct DiskUsageCache {
    paths: StatePaths,
    entries: Arc<DashMap<String, (Instant, DiskUsage)>>,
}

impl DiskUsageCache {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Cached decomposition if still fresh.
    pub fn cached(&self, tenant_id: &str) -> Option<DiskUsage> {
        self.entries.get(tenant_id).and_then(|entry| {
            let (at, usage) = *entry;
            (at.elapsed() < DISK_CACHE_TTL).then_some(usage)
        })
    }

    /// Compute (or reuse within the TTL) the tenant's disk decomposition.
    /// The walk runs on the blocking pool.
    pub async fn compute(&self, tenant_id: &str) -> Result<DiskUsage> {
        if let Some(hit) = self.cached(tenant_id) {
            return Ok(hit);
        }
        let root = self.paths.tenant_dir(tenant_id);
        let workspace = self.paths.tenant_workspace(tenant_id);
        let agents = self.paths.tenant_agents_dir(tenant_id);
        let memory = self.paths.tenant_memory_dir(tenant_id);
        let usage = tokio::task::spawn_blocking(move || DiskUsage {
            total_bytes: dir_size(&root),
            workspace_bytes: dir_size(&workspace),
            agent_data_bytes: dir_size(&agents),
            memory_bytes: dir_size(&memory),
        })
        .await
        .context("disk usage walk panicked")?;
        self.entries
            .insert(tenant_id.to_string(), (Instant::now(), usage));
        Ok(usage)
    }

    /// Forget a tenant's cache entry (after restore or delete).
    pub fn invalidate(&self, tenant_id: &str) {
        self.entries.remove(tenant_id);
    }
}

/// Percentage of a cap consumed. May exceed 100 when the limit is already
/// breached; callers distinguish "over" from "approaching".
pub fn percent_of(used: u64, cap: u64) -> f64 {
    if cap == 0 {
        return 0.0;
    }
    (used as f64 / cap as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compute_decomposes_subtrees() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        paths.init_tenant_tree("demo").unwrap();
        std::fs::write(paths.tenant_workspace("demo").join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(paths.tenant_memory_dir("demo").join("m.db"), vec![0u8; 40]).unwrap();

        let cache = DiskUsageCache::new(paths);
        let usage = cache.compute("demo").await.unwrap();
        assert_eq!(usage.workspace_bytes, 100);
        assert_eq!(usage.memory_bytes, 40);
        assert!(usage.total_bytes >= 140);
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        paths.init_tenant_tree("demo").unwrap();
        let cache = DiskUsageCache::new(paths.clone());

        let first = cache.compute("demo").await.unwrap();
        std::fs::write(paths.tenant_workspace("demo").join("late.txt"), vec![0u8; 64]).unwrap();
        // Second call inside the TTL returns the stale value.
        let second = cache.compute("demo").await.unwrap();
        assert_eq!(first, second);

        cache.invalidate("demo");
        let third = cache.compute("demo").await.unwrap();
        assert_eq!(third.workspace_bytes, 64);
    }

    #[test]
    fn test_percent_not_clamped() {
        assert_eq!(percent_of(150, 100), 150.0);
        assert_eq!(percent_of(0, 0), 0.0);
    }
}
