//! Object-store seam for backup blobs.
//!
//! Off-box storage is an external collaborator; the orchestrator only needs
//! `put/get/list/delete` by key. A filesystem-backed implementation serves
//! single-node deployments and tests; remote backends plug in behind the same
//! trait with endpoint/region/path-style settings passed straight through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// One listed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Byte-blob store keyed by slash-separated strings.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: HashMap<String, String>)
        -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

const META_SUFFIX: &str = ".meta.json";

/// Filesystem-backed object store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keys are validated so a hostile key can never leave the root.
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') {
            bail!("invalid object key '{key}'");
        }
        if Path::new(key)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            bail!("invalid object key '{key}'");
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.context("creating object dir")?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing object {key}"))?;
        if !metadata.is_empty() {
            let meta_path = path.with_file_name(format!(
                "{}{META_SUFFIX}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ));
            let json = serde_json::to_vec(&metadata).context("serializing object metadata")?;
            fs::write(meta_path, json).await.context("writing object metadata")?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("object '{key}' not found"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // Walk from the deepest existing directory of the prefix and filter.
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.ends_with(META_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                let last_modified = meta
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from);
                out.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    last_modified,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting object '{key}'"))?;
        let meta_path = path.with_file_name(format!(
            "{}{META_SUFFIX}",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        let _ = fs::remove_file(meta_path).await;
        Ok(())
    }
}
