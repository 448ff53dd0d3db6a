//! TOML configuration file loading
//!
//! Supports `~/.config/citadel/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CitadelConfigFile {
    /// Node identifier (defaults to the hostname)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Authorization service URL
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Directory holding `citadel.yaml`
    #[serde(default)]
    pub manifest_dir: Option<String>,

    /// Broker connection
    #[serde(default)]
    pub broker: BrokerFileConfig,

    /// Job consumption
    #[serde(default)]
    pub worker: WorkerFileConfig,

    /// Status publishing
    #[serde(default)]
    pub telemetry: TelemetryFileConfig,

    /// Inference backends
    #[serde(default)]
    pub inference: InferenceFileConfig,

    /// Local status server
    #[serde(default)]
    pub status: StatusFileConfig,
}

/// Broker connection; either a direct Redis URL or the API proxy
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerFileConfig {
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub org_id: Option<String>,
}

/// Job consumption
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerFileConfig {
    pub queues: Option<Vec<String>>,
    pub consumer_group: Option<String>,
    pub consumer_name: Option<String>,
    pub block_ms: Option<u64>,
    pub claim_idle_secs: Option<u64>,
    pub max_attempts: Option<u64>,
    pub config_queue: Option<String>,
    pub config_group: Option<String>,
}

/// Status publishing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryFileConfig {
    pub interval_secs: Option<u64>,
    pub keep_alive_every: Option<u64>,
}

/// Inference backends
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferenceFileConfig {
    pub default_backend: Option<String>,
    pub vllm_url: Option<String>,
    pub ollama_url: Option<String>,
    pub llamacpp_url: Option<String>,
    pub readiness_max_wait_secs: Option<u64>,
}

/// Local status server
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusFileConfig {
    pub port: Option<u16>,
}

/// Parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML for this schema
pub fn read_config_file(path: &Path) -> crate::Result<CitadelConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load the TOML config file from `path`, or the standard path if `None`
///
/// A missing file yields defaults. An explicitly named file that cannot be
/// read or parsed is an error; a broken file at the standard path is logged
/// and ignored.
///
/// # Errors
///
/// Returns error only for an explicit `path`
pub fn load_config_file(path: Option<&Path>) -> crate::Result<CitadelConfigFile> {
    if let Some(path) = path {
        let config = read_config_file(path)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(CitadelConfigFile::default());
    };
    if !path.exists() {
        return Ok(CitadelConfigFile::default());
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            Ok(config)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            Ok(CitadelConfigFile::default())
        }
    }
}

/// Per-user config directory: `~/.config/citadel`
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("citadel"))
}

/// Return the config file path: `~/.config/citadel/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
