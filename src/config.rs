//! Gateway configuration.
//!
//! Layered the usual way: defaults, then an optional config file, then
//! environment variables prefixed `CLAWGATE_`, then CLI flag overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 8643;

/// Object-store connection settings, passed through to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Local directory for the filesystem backend.
    pub local_dir: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub path_style: bool,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Root of all persisted gateway state.
    pub state_dir: PathBuf,
    /// Shared secret for the internal control plane. Absent means the whole
    /// control plane is disabled (every request denied).
    pub control_plane_token: Option<String>,
    /// Whether schedulers start at boot.
    pub scheduling_enabled: bool,
    /// Key prefix for backup objects.
    pub backup_prefix: String,
    pub object_store: ObjectStoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            state_dir: PathBuf::from("./state"),
            control_plane_token: None,
            scheduling_enabled: true,
            backup_prefix: "backups".to_string(),
            object_store: ObjectStoreConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path.clone())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(Environment::with_prefix("CLAWGATE").separator("__"))
            .build()
            .context("assembling configuration")?;
        let mut config: GatewayConfig = settings
            .try_deserialize()
            .context("deserializing configuration")?;
        if config.backup_prefix.is_empty() {
            config.backup_prefix = "backups".to_string();
        }
        Ok(config)
    }

    /// Object-store directory for the filesystem backend, defaulting to a
    /// sibling of the state dir.
    pub fn object_store_dir(&self) -> PathBuf {
        self.object_store
            .local_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("objects"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.scheduling_enabled);
        assert!(config.control_plane_token.is_none());
        assert_eq!(config.backup_prefix, "backups");
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("clawgate.toml");
        std::fs::write(
            &path,
            "port = 9000\ncontrol_plane_token = \"cp-secret\"\nscheduling_enabled = false\n",
        )
        .unwrap();
        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.control_plane_token.as_deref(), Some("cp-secret"));
        assert!(!config.scheduling_enabled);
    }

    #[test]
    fn test_object_store_dir_defaults_under_state() {
        let config = GatewayConfig::default();
        assert!(config.object_store_dir().ends_with("objects"));
    }
}
