//! Persisted tenant registry.
//!
//! All tenants live in one JSON document (`tenants.json`) with a version
//! header. Every mutation is load-then-mutate-then-save under a single-writer
//! lock; reads load and close without holding it. Writes land with mode 0600
//! so group/other can never read token hashes.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::paths::StatePaths;

use super::token::{self, ParsedToken};
use super::{TenantContext, TenantEntry, TenantQuotas, TenantUpdate};

/// Current on-disk document version.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDoc {
    version: u32,
    tenants: BTreeMap<String, TenantEntry>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            tenants: BTreeMap::new(),
        }
    }
}

/// The tenant registry. Cheap to clone; the write lock is shared.
#[derive(Clone)]
pub struct TenantRegistry {
    paths: StatePaths,
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl TenantRegistry {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            write_lock: std::sync::Arc::new(Mutex::new(())),
        }
    }

    pub fn state_paths(&self) -> &StatePaths {
        &self.paths
    }

    fn registry_file(&self) -> PathBuf {
        self.paths.registry_file()
    }

    /// Load the registry document. A missing or unreadable file bootstraps an
    /// empty registry so first-run installs need no setup step.
    fn load(&self) -> RegistryDoc {
        let raw = match fs::read_to_string(self.registry_file()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return RegistryDoc::default(),
            Err(err) => {
                warn!("tenant registry unreadable, treating as empty: {err}");
                return RegistryDoc::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("tenant registry malformed, treating as empty: {err}");
                RegistryDoc::default()
            }
        }
    }

    fn save(&self, doc: &RegistryDoc) -> Result<()> {
        let path = self.registry_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating state dir")?;
        }
        let json = serde_json::to_string_pretty(doc).context("serializing tenant registry")?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("restricting tenant registry permissions")?;
        }
        Ok(())
    }

    /// Register a new tenant. Returns the plaintext token, shown exactly once.
    pub async fn create(&self, tenant_id: &str, display_name: Option<String>) -> Result<String> {
        if !token::is_valid_tenant_id(tenant_id) {
            bail!("invalid tenant id '{tenant_id}': expected ^[a-z0-9][a-z0-9_-]{{0,31}}$");
        }
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load();
        if doc.tenants.contains_key(tenant_id) {
            bail!("tenant '{tenant_id}' already exists");
        }
        let (plaintext, token_hash) = token::mint_token(tenant_id);
        doc.tenants.insert(
            tenant_id.to_string(),
            TenantEntry {
                token_hash,
                created_at: Utc::now(),
                last_seen_at: None,
                display_name,
                disabled: false,
                quotas: None,
            },
        );
        self.save(&doc)?;
        self.paths.init_tenant_tree(tenant_id)?;
        info!("created tenant {tenant_id}");
        Ok(plaintext)
    }

    /// Remove a tenant. With `delete_data` the whole state subtree goes too.
    pub async fn remove(&self, tenant_id: &str, delete_data: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load();
        if doc.tenants.remove(tenant_id).is_none() {
            bail!("tenant '{tenant_id}' not found");
        }
        self.save(&doc)?;
        if delete_data {
            let dir = self.paths.tenant_dir(tenant_id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("deleted state subtree for tenant {tenant_id}"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err).context("deleting tenant state subtree"),
            }
        }
        info!("removed tenant {tenant_id}");
        Ok(())
    }

    /// Replace the tenant's secret. Returns the new plaintext token.
    pub async fn rotate(&self, tenant_id: &str) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load();
        let entry = doc
            .tenants
            .get_mut(tenant_id)
            .with_context(|| format!("tenant '{tenant_id}' not found"))?;
        let (plaintext, token_hash) = token::mint_token(tenant_id);
        entry.token_hash = token_hash;
        self.save(&doc)?;
        info!("rotated token for tenant {tenant_id}");
        Ok(plaintext)
    }

    /// Selective field update.
    pub async fn update(&self, tenant_id: &str, update: TenantUpdate) -> Result<TenantEntry> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load();
        let entry = doc
            .tenants
            .get_mut(tenant_id)
            .with_context(|| format!("tenant '{tenant_id}' not found"))?;
        if let Some(name) = update.display_name {
            entry.display_name = if name.is_empty() { None } else { Some(name) };
        }
        if let Some(disabled) = update.disabled {
            entry.disabled = disabled;
        }
        if let Some(quotas) = update.quotas {
            entry.quotas = Some(quotas);
        }
        let updated = entry.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    pub fn get(&self, tenant_id: &str) -> Option<TenantEntry> {
        self.load().tenants.get(tenant_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.load().tenants.keys().cloned().collect()
    }

    pub fn quotas(&self, tenant_id: &str) -> Option<TenantQuotas> {
        self.get(tenant_id).and_then(|e| e.quotas)
    }

    /// Validate a presented token string. On success the tenant's last-seen
    /// timestamp is refreshed and a resolved context is returned.
    pub async fn validate_token(&self, presented: &str) -> Option<TenantContext> {
        let ParsedToken { tenant_id, secret } = token::parse_token(presented)?;
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load();
        let entry = doc.tenants.get_mut(&tenant_id)?;
        if entry.disabled {
            return None;
        }
        if !token::verify_secret(&secret, &entry.token_hash) {
            return None;
        }
        entry.last_seen_at = Some(Utc::now());
        let context = TenantContext {
            tenant_id: tenant_id.clone(),
            state_dir: self.paths.tenant_dir(&tenant_id),
            display_name: entry.display_name.clone(),
            quotas: entry.quotas.clone(),
        };
        if let Err(err) = self.save(&doc) {
            warn!("failed to persist last-seen for tenant {tenant_id}: {err}");
        }
        Some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, TenantRegistry) {
        let temp = TempDir::new().unwrap();
        let reg = TenantRegistry::new(StatePaths::new(temp.path()));
        (temp, reg)
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let (_temp, reg) = registry();
        let plaintext = reg.create("demo", None).await.unwrap();
        assert_eq!(reg.list(), vec!["demo".to_string()]);

        let ctx = reg.validate_token(&plaintext).await.unwrap();
        assert_eq!(ctx.tenant_id, "demo");
        assert!(ctx.state_dir.ends_with("tenants/demo"));
        assert!(reg.get("demo").unwrap().last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_id_and_duplicates() {
        let (_temp, reg) = registry();
        assert!(reg.create("Bad Id", None).await.is_err());
        reg.create("demo", None).await.unwrap();
        assert!(reg.create("demo", None).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_tenant_fails_validation() {
        let (_temp, reg) = registry();
        let plaintext = reg.create("demo", None).await.unwrap();
        reg.update(
            "demo",
            TenantUpdate {
                disabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(reg.validate_token(&plaintext).await.is_none());
    }

    #[tokio::test]
    async fn test_rotate_invalidates_old_token() {
        let (_temp, reg) = registry();
        let old = reg.create("demo", None).await.unwrap();
        let new = reg.rotate("demo").await.unwrap();
        assert_ne!(old, new);
        assert!(reg.validate_token(&old).await.is_none());
        assert!(reg.validate_token(&new).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_with_delete_data() {
        let (temp, reg) = registry();
        reg.create("demo", None).await.unwrap();
        let dir = temp.path().join("tenants/demo");
        assert!(dir.is_dir());
        reg.remove("demo", true).await.unwrap();
        assert!(!dir.exists());
        assert!(reg.get("demo").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registry_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let (temp, reg) = registry();
        reg.create("demo", None).await.unwrap();
        let mode = std::fs::metadata(temp.path().join("tenants.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
