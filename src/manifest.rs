//! Node manifest writer
//!
//! The default [`ConfigApplier`]: merges a [`ConfigUpdate`] into
//! `<manifest_dir>/citadel.yaml`. Starting the listed services is left to the
//! node's service manager.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::subscriber::ConfigUpdate;
use crate::{Error, Result};

/// Manifest file name inside the manifest directory
pub const MANIFEST_FILE: &str = "citadel.yaml";

/// Tags every provisioned node carries ahead of its custom tags
pub const BASE_TAGS: [&str; 2] = ["gpu", "provisioned-by-citadel"];

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,32}$").expect("valid regex"));

/// Applies validated configuration updates to the node
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    /// Apply an update, returning a short human-readable summary
    async fn apply(&self, update: &ConfigUpdate) -> Result<String>;
}

/// `citadel.yaml` contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub node: ManifestNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ManifestService>,
    #[serde(default)]
    pub config: ManifestFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestNode {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestService {
    pub name: String,
    pub compose_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFlags {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ssh_enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub health_monitoring_enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub alert_on_offline: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub alert_on_high_temp: bool,
}

impl Manifest {
    /// Merge an update into this manifest
    ///
    /// Name and tags change only when the update provides them; services and
    /// flags are replaced. Service names outside `^[a-z0-9-]{1,32}$` are
    /// skipped.
    pub fn merge(&mut self, update: &ConfigUpdate) {
        if !update.device_name.is_empty() {
            self.node.name.clone_from(&update.device_name);
        }

        if !update.custom_tags.is_empty() {
            self.node.tags = BASE_TAGS
                .iter()
                .map(ToString::to_string)
                .chain(update.custom_tags.iter().cloned())
                .collect();
        }

        self.services = update
            .services
            .iter()
            .filter(|name| {
                let ok = SERVICE_NAME.is_match(name);
                if !ok {
                    tracing::warn!(service = %name, "skipping invalid service name");
                }
                ok
            })
            .map(|name| ManifestService {
                name: name.clone(),
                compose_file: format!("services/{name}.yml"),
            })
            .collect();

        self.config = ManifestFlags {
            ssh_enabled: update.ssh_enabled,
            health_monitoring_enabled: update.health_monitoring_enabled,
            alert_on_offline: update.alert_on_offline,
            alert_on_high_temp: update.alert_on_high_temp,
        };
    }
}

/// Writes config updates to the manifest on disk
#[derive(Debug, Clone)]
pub struct ManifestApplier {
    dir: PathBuf,
}

impl ManifestApplier {
    /// Create an applier writing under `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the manifest file
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Load the current manifest, or an empty one if none exists
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub async fn load(&self) -> Result<Manifest> {
        load_manifest(&self.path()).await
    }
}

async fn load_manifest(path: &Path) -> Result<Manifest> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| {
            Error::Manifest(format!("failed to parse {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ConfigApplier for ManifestApplier {
    async fn apply(&self, update: &ConfigUpdate) -> Result<String> {
        let path = self.path();
        let mut manifest = load_manifest(&path).await?;
        manifest.merge(update);

        tokio::fs::create_dir_all(&self.dir).await?;
        let yaml = serde_yaml::to_string(&manifest)?;

        // Write-then-rename so readers never see a partial file
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(path = %path.display(), "manifest written");
        Ok(format!(
            "manifest updated for {:?} with {} service(s)",
            manifest.node.name,
            manifest.services.len()
        ))
    }
}
