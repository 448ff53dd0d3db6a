//! Configuration management for the Citadel agent
//!
//! Every setting resolves env > TOML file > default. Environment variables
//! carry the `CITADEL_` prefix.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::auth::DeviceToken;
use crate::broker::mask_url;
use crate::inference::backends::{DEFAULT_LLAMACPP_URL, DEFAULT_OLLAMA_URL, DEFAULT_VLLM_URL};
use crate::inference::{DEFAULT_BACKEND, DispatcherSettings};
use crate::node_id::NodeId;
use crate::status_server::DEFAULT_STATUS_PORT;
use crate::worker::{
    CONFIG_GROUP, CONFIG_QUEUE, DEFAULT_CLAIM_IDLE, DEFAULT_GROUP, DEFAULT_QUEUE, worker_id,
};
use crate::{Error, Result};

use self::file::CitadelConfigFile;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CITADEL_";

/// Default authorization service
pub const DEFAULT_AUTH_URL: &str = "https://aceteam.ai";

/// How the agent reaches the broker
#[derive(Clone)]
pub enum Transport {
    /// Direct Redis connection
    Redis {
        url: String,
        password: Option<SecretString>,
    },
    /// Authenticated HTTP proxy in front of the broker
    Api {
        base_url: String,
        token: SecretString,
        org_id: String,
    },
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis { url, password } => f
                .debug_struct("Redis")
                .field("url", &mask_url(url))
                .field("password", &password.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            Self::Api {
                base_url, org_id, ..
            } => f
                .debug_struct("Api")
                .field("base_url", base_url)
                .field("token", &"[REDACTED]")
                .field("org_id", org_id)
                .finish(),
        }
    }
}

impl Transport {
    /// Transport granted by a device authorization
    ///
    /// Prefers the API proxy when the grant carries a device API token.
    #[must_use]
    pub fn from_token(token: &DeviceToken) -> Option<Self> {
        if let (Some(api_token), Some(base_url), Some(org_id)) = (
            token.device_api_token.as_ref(),
            token.api_base_url.as_ref(),
            token.org_id.as_ref(),
        ) {
            return Some(Self::Api {
                base_url: base_url.clone(),
                token: SecretString::from(api_token.clone()),
                org_id: org_id.clone(),
            });
        }
        token.redis_url.as_ref().map(|url| Self::Redis {
            url: url.clone(),
            password: None,
        })
    }

    /// Short label for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Redis { .. } => "redis",
            Self::Api { .. } => "api",
        }
    }
}

/// Job consumption settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job queues, in read order
    pub queues: Vec<String>,
    /// Consumer group for job queues
    pub group: String,
    /// This node's consumer name in both groups
    pub consumer: String,
    /// Claim records other consumers left pending this long; `None` disables
    pub claim_idle: Option<Duration>,
    /// Server-side block per read
    pub block: Duration,
    /// Deliveries allowed before dead-lettering
    pub max_attempts: u64,
    /// Device configuration queue
    pub config_queue: String,
    /// Consumer group for the configuration queue
    pub config_group: String,
}

/// Status publishing settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Time between status publishes
    pub interval: Duration,
    /// Mesh keep-alive every this many ticks
    pub keep_alive_every: u64,
}

/// Inference backend settings
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub default_backend: String,
    pub vllm_url: String,
    pub ollama_url: String,
    pub llamacpp_url: String,
    /// Give up on a backend that is not ready after this long
    pub readiness_max_wait: Duration,
}

impl InferenceConfig {
    /// Dispatcher settings for these backends
    #[must_use]
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            default_backend: self.default_backend.clone(),
            readiness_max_wait: self.readiness_max_wait,
            ..DispatcherSettings::default()
        }
    }
}

/// Citadel agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identity in channel and consumer names
    pub node_id: NodeId,

    /// Broker transport; `None` until credentials are configured or granted
    pub transport: Option<Transport>,

    /// Authorization service base URL
    pub auth_url: String,

    /// Directory holding `citadel.yaml`
    pub manifest_dir: PathBuf,

    /// Local status server port
    pub status_port: u16,

    pub worker: WorkerConfig,
    pub telemetry: TelemetryConfig,
    pub inference: InferenceConfig,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the node ID is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the node ID is invalid
    pub fn from_sources(
        fc: CitadelConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |name: &str| {
            env(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let node_id = var("NODE_ID")
            .or(fc.node_id)
            .unwrap_or_else(default_node_id);
        let node_id =
            NodeId::new(node_id).map_err(|e| Error::Config(format!("invalid node id: {e}")))?;

        let transport = resolve_transport(&var, fc.broker)?;

        let queues = match var("QUEUES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect(),
            None => fc
                .worker
                .queues
                .unwrap_or_else(|| vec![DEFAULT_QUEUE.to_string()]),
        };
        if queues.is_empty() {
            return Err(Error::Config("at least one job queue is required".to_string()));
        }

        let block_ms = parse("BLOCK_MS", var("BLOCK_MS"))?
            .or(fc.worker.block_ms)
            .unwrap_or(5000);
        if block_ms == 0 {
            // 0 would block forever on Redis
            return Err(Error::Config(
                "block time must be at least 1 millisecond".to_string(),
            ));
        }
        let claim_idle_secs = parse("CLAIM_IDLE_SECS", var("CLAIM_IDLE_SECS"))?
            .or(fc.worker.claim_idle_secs)
            .unwrap_or(DEFAULT_CLAIM_IDLE.as_secs());

        let worker = WorkerConfig {
            queues,
            group: var("CONSUMER_GROUP")
                .or(fc.worker.consumer_group)
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            consumer: var("CONSUMER_NAME")
                .or(fc.worker.consumer_name.filter(|c| !c.trim().is_empty()))
                .unwrap_or_else(|| worker_id(node_id.as_str())),
            claim_idle: (claim_idle_secs > 0).then_some(Duration::from_secs(claim_idle_secs)),
            block: Duration::from_millis(block_ms),
            max_attempts: parse("MAX_ATTEMPTS", var("MAX_ATTEMPTS"))?
                .or(fc.worker.max_attempts)
                .unwrap_or(3),
            config_queue: fc
                .worker
                .config_queue
                .unwrap_or_else(|| CONFIG_QUEUE.to_string()),
            config_group: fc
                .worker
                .config_group
                .unwrap_or_else(|| CONFIG_GROUP.to_string()),
        };

        let interval_secs = parse("HEARTBEAT_INTERVAL_SECS", var("HEARTBEAT_INTERVAL_SECS"))?
            .or(fc.telemetry.interval_secs)
            .unwrap_or(30);
        if interval_secs == 0 {
            return Err(Error::Config(
                "heartbeat interval must be at least 1 second".to_string(),
            ));
        }
        let telemetry = TelemetryConfig {
            interval: Duration::from_secs(interval_secs),
            keep_alive_every: fc.telemetry.keep_alive_every.unwrap_or(2),
        };

        let inference = InferenceConfig {
            default_backend: var("DEFAULT_BACKEND")
                .or(fc.inference.default_backend)
                .map_or_else(|| DEFAULT_BACKEND.to_string(), |b| b.to_ascii_lowercase()),
            vllm_url: var("VLLM_URL")
                .or(fc.inference.vllm_url)
                .unwrap_or_else(|| DEFAULT_VLLM_URL.to_string()),
            ollama_url: var("OLLAMA_URL")
                .or(fc.inference.ollama_url)
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            llamacpp_url: var("LLAMACPP_URL")
                .or(fc.inference.llamacpp_url)
                .unwrap_or_else(|| DEFAULT_LLAMACPP_URL.to_string()),
            readiness_max_wait: Duration::from_secs(
                fc.inference.readiness_max_wait_secs.unwrap_or(60),
            ),
        };

        let manifest_dir = var("MANIFEST_DIR")
            .or(fc.manifest_dir)
            .map(PathBuf::from)
            .or_else(file::config_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            node_id,
            transport,
            auth_url: var("AUTH_URL")
                .or(fc.auth_url)
                .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            manifest_dir,
            status_port: parse("STATUS_PORT", var("STATUS_PORT"))?
                .or(fc.status.port)
                .unwrap_or(DEFAULT_STATUS_PORT),
            worker,
            telemetry,
            inference,
        })
    }
}

fn resolve_transport(
    var: &impl Fn(&str) -> Option<String>,
    broker: file::BrokerFileConfig,
) -> Result<Option<Transport>> {
    let api_base_url = var("API_BASE_URL").or(broker.api_base_url);
    let api_token = var("API_TOKEN").or(broker.api_token);
    let redis_url = var("REDIS_URL").or(broker.redis_url);

    match (api_base_url, api_token) {
        (Some(base_url), Some(token)) => {
            let org_id = var("ORG_ID").or(broker.org_id).ok_or_else(|| {
                Error::Config(format!("{ENV_PREFIX}ORG_ID is required with the API transport"))
            })?;
            Ok(Some(Transport::Api {
                base_url,
                token: SecretString::from(token),
                org_id,
            }))
        }
        (Some(_), None) => Err(Error::Config(format!(
            "{ENV_PREFIX}API_TOKEN is required with {ENV_PREFIX}API_BASE_URL"
        ))),
        (None, _) => Ok(redis_url.map(|url| Transport::Redis {
            url,
            password: var("REDIS_PASSWORD")
                .or(broker.redis_password)
                .map(SecretString::from),
        })),
    }
}

fn parse<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {ENV_PREFIX}{name} {v:?}: {e}")))
        })
        .transpose()
}

/// Hostname, reduced to the characters allowed in a node ID
fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if id.is_empty() {
        "citadel-node".to_string()
    } else {
        id
    }
}
