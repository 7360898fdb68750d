//! Per-tenant backup/restore against the object store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::info;
use serde::Serialize;

use crate::tenant::TenantRegistry;

use super::archive;
use super::store::{ObjectInfo, ObjectStore};

/// Outcome of one backup.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub key: String,
    pub size: u64,
    pub timestamp: String,
}

/// Orchestrates archive ↔ object-store transfer for tenant state subtrees.
#[derive(Clone)]
pub struct BackupOrchestrator {
    registry: TenantRegistry,
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl BackupOrchestrator {
    pub fn new(registry: TenantRegistry, store: Arc<dyn ObjectStore>, prefix: String) -> Self {
        Self {
            registry,
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn tenant_prefix(&self, tenant_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("{tenant_id}/")
        } else {
            format!("{}/{tenant_id}/", self.prefix)
        }
    }

    /// Archive the tenant's state subtree and upload it. The key defaults to
    /// `{prefix}/{tenantId}/{tenantId}-{timestamp}.tar.gz`.
    pub async fn backup(&self, tenant_id: &str, key: Option<String>) -> Result<BackupInfo> {
        if self.registry.get(tenant_id).is_none() {
            bail!("tenant '{tenant_id}' not found");
        }
        let state_dir = self.registry.state_paths().tenant_dir(tenant_id);
        if !state_dir.is_dir() {
            bail!("tenant '{tenant_id}' has no state directory");
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
        let key = key.unwrap_or_else(|| {
            format!(
                "{}{tenant_id}-{timestamp}.tar.gz",
                self.tenant_prefix(tenant_id)
            )
        });

        let bytes = tokio::task::spawn_blocking(move || archive::create_archive(&state_dir))
            .await
            .context("archive task panicked")??;
        let size = bytes.len() as u64;

        let mut metadata = HashMap::new();
        metadata.insert("tenantId".to_string(), tenant_id.to_string());
        metadata.insert("timestamp".to_string(), timestamp.clone());
        metadata.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        self.store
            .put(&key, bytes, metadata)
            .await
            .context("uploading backup archive")?;

        info!("backed up tenant {tenant_id} to {key} ({size} bytes)");
        Ok(BackupInfo {
            key,
            size,
            timestamp,
        })
    }

    /// Download a snapshot and extract it into the tenant's (cleared) state
    /// directory. `create_if_missing` is an admin-only affordance.
    pub async fn restore(
        &self,
        tenant_id: &str,
        key: &str,
        create_if_missing: bool,
    ) -> Result<()> {
        if self.registry.get(tenant_id).is_none() {
            if !create_if_missing {
                bail!("tenant '{tenant_id}' not found");
            }
            self.registry.create(tenant_id, None).await?;
        }

        let bytes = self
            .store
            .get(key)
            .await
            .context("downloading backup archive")?;

        let state_dir = self.registry.state_paths().tenant_dir(tenant_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            // Clear current contents, keep the directory itself.
            if state_dir.is_dir() {
                for entry in std::fs::read_dir(&state_dir).context("listing state dir")? {
                    let entry = entry?;
                    let path = entry.path();
                    if entry.file_type()?.is_dir() {
                        std::fs::remove_dir_all(&path)
                            .with_context(|| format!("removing {}", path.display()))?;
                    } else {
                        std::fs::remove_file(&path)
                            .with_context(|| format!("removing {}", path.display()))?;
                    }
                }
            } else {
                std::fs::create_dir_all(&state_dir).context("creating state dir")?;
            }
            let report = archive::extract_archive(&bytes, &state_dir)?;
            info!(
                "restore extracted {} entries ({} rejected by path filter)",
                report.extracted, report.rejected
            );
            Ok(())
        })
        .await
        .context("restore task panicked")??;

        info!("restored tenant {tenant_id} from {key}");
        Ok(())
    }

    /// Archived snapshots for a tenant, newest first.
    pub async fn list_backups(&self, tenant_id: &str) -> Result<Vec<ObjectInfo>> {
        let mut entries = self.store.list(&self.tenant_prefix(tenant_id)).await?;
        entries.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(entries)
    }

    /// Delete one snapshot by key, confined to the tenant's prefix.
    pub async fn delete_backup(&self, tenant_id: &str, key: &str) -> Result<()> {
        if !key.starts_with(&self.tenant_prefix(tenant_id)) {
            bail!("key '{key}' does not belong to tenant '{tenant_id}'");
        }
        self.store.delete(key).await
    }

    /// Keep the newest `keep_count` snapshots, delete the rest. Returns how
    /// many were removed.
    pub async fn prune(&self, tenant_id: &str, keep_count: usize) -> Result<usize> {
        let entries = self.list_backups(tenant_id).await?;
        let mut deleted = 0;
        for entry in entries.into_iter().skip(keep_count) {
            self.store.delete(&entry.key).await?;
            deleted += 1;
        }
        if deleted > 0 {
            info!("pruned {deleted} backup(s) for tenant {tenant_id}");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::FsObjectStore;
    use crate::paths::StatePaths;
    use tempfile::TempDir;

    async fn orchestrator() -> (TempDir, TenantRegistry, BackupOrchestrator) {
        let temp = TempDir::new().unwrap();
        let registry = TenantRegistry::new(StatePaths::new(temp.path().join("state")));
        registry.create("demo", None).await.unwrap();
        let store = Arc::new(FsObjectStore::new(temp.path().join("objects")));
        let orchestrator =
            BackupOrchestrator::new(registry.clone(), store, "backups".to_string());
        (temp, registry, orchestrator)
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip() {
        let (_temp, registry, orchestrator) = orchestrator().await;
        let paths = registry.state_paths().clone();
        std::fs::write(paths.tenant_workspace("demo").join("notes.txt"), b"keep me").unwrap();

        let info = orchestrator.backup("demo", None).await.unwrap();
        assert!(info.key.starts_with("backups/demo/demo-"));
        assert!(info.size > 0);

        // Mutate, then restore and observe the old contents back.
        std::fs::write(paths.tenant_workspace("demo").join("notes.txt"), b"changed").unwrap();
        std::fs::write(paths.tenant_workspace("demo").join("extra.txt"), b"junk").unwrap();
        orchestrator.restore("demo", &info.key, false).await.unwrap();

        assert_eq!(
            std::fs::read(paths.tenant_workspace("demo").join("notes.txt")).unwrap(),
            b"keep me"
        );
        assert!(!paths.tenant_workspace("demo").join("extra.txt").exists());
    }

    #[tokio::test]
    async fn test_list_newest_first_and_prune() {
        let (_temp, _registry, orchestrator) = orchestrator().await;
        let a = orchestrator
            .backup("demo", Some("backups/demo/demo-2026-01-01T00-00-00Z.tar.gz".into()))
            .await
            .unwrap();
        let b = orchestrator
            .backup("demo", Some("backups/demo/demo-2026-06-01T00-00-00Z.tar.gz".into()))
            .await
            .unwrap();

        let listed = orchestrator.list_backups("demo").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, b.key);
        assert_eq!(listed[1].key, a.key);

        assert_eq!(orchestrator.prune("demo", 1).await.unwrap(), 1);
        let listed = orchestrator.list_backups("demo").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, b.key);
    }

    #[tokio::test]
    async fn test_delete_confined_to_tenant_prefix() {
        let (_temp, _registry, orchestrator) = orchestrator().await;
        let err = orchestrator
            .delete_backup("demo", "backups/other/other-1.tar.gz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[tokio::test]
    async fn test_restore_missing_tenant_requires_create_flag() {
        let (_temp, registry, orchestrator) = orchestrator().await;
        let info = orchestrator.backup("demo", None).await.unwrap();
        assert!(orchestrator
            .restore("ghost", &info.key, false)
            .await
            .is_err());
        orchestrator.restore("ghost", &info.key, true).await.unwrap();
        assert!(registry.get("ghost").is_some());
    }
}
