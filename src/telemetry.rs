//! Node status telemetry
//!
//! Publishes a fresh [`StatusSnapshot`] once at start and then on a fixed
//! interval: first to the node's broadcast channel for live dashboards, then
//! to a capped durable stream for history. The broadcast is what matters; a
//! failed stream append is only logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::Publisher;
use crate::device_code::DeviceCode;
use crate::node_id::NodeId;
use crate::{Error, Result};

/// Snapshot schema version
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Durable status stream shared by all nodes
pub const STATUS_STREAM: &str = "node:status:stream";

/// Approximate cap on the status stream
pub const STATUS_STREAM_MAX_LEN: usize = 10_000;

/// Collects the node's current status
#[async_trait]
pub trait StatusCollector: Send + Sync {
    /// Collect a status document
    async fn collect(&self) -> Result<serde_json::Value>;
}

/// Keeps the mesh-network connection warm
#[async_trait]
pub trait MeshKeepAlive: Send + Sync {
    /// Nudge the mesh connection
    async fn keep_alive(&self) -> Result<()>;
}

/// Keep-alive for nodes without a managed mesh client
///
/// Records the tick in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingKeepAlive;

#[async_trait]
impl MeshKeepAlive for LoggingKeepAlive {
    async fn keep_alive(&self) -> Result<()> {
        tracing::debug!("mesh keep-alive tick");
        Ok(())
    }
}

/// Status collector reporting process-level facts only
#[derive(Debug, Clone)]
pub struct BasicCollector {
    hostname: String,
    started: Instant,
}

/// Document produced by [`BasicCollector`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStatus {
    pub hostname: String,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub uptime_secs: u64,
}

impl BasicCollector {
    /// Create a collector; uptime is measured from now
    #[must_use]
    pub fn new() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            hostname,
            started: Instant::now(),
        }
    }
}

impl Default for BasicCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusCollector for BasicCollector {
    async fn collect(&self) -> Result<serde_json::Value> {
        let status = BasicStatus {
            hostname: self.hostname.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
        };
        Ok(serde_json::to_value(status)?)
    }
}

/// Versioned status message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub version: String,
    pub timestamp: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_code: Option<String>,
    pub status: serde_json::Value,
}

impl StatusSnapshot {
    /// Build a fresh snapshot from the collector and current device code
    ///
    /// # Errors
    ///
    /// Returns `Error::Status` if collection fails
    pub async fn collect(
        collector: &dyn StatusCollector,
        node_id: &NodeId,
        device_code: &DeviceCode,
    ) -> Result<Self> {
        let status = collector
            .collect()
            .await
            .map_err(|e| Error::Status(format!("failed to collect status: {e}")))?;

        Ok(Self {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            node_id: node_id.to_string(),
            device_code: device_code.get().await.filter(|c| !c.is_empty()),
            status,
        })
    }

    /// Fields appended to the durable stream alongside the JSON payload
    fn stream_fields(&self, payload: String) -> Vec<(String, String)> {
        let mut fields = vec![
            ("nodeId".to_string(), self.node_id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("payload".to_string(), payload),
        ];
        if let Some(code) = &self.device_code {
            fields.push(("deviceCode".to_string(), code.clone()));
        }
        fields
    }
}

/// Broadcast channel for direct-broker mode
#[must_use]
pub fn node_channel(node_id: &NodeId) -> String {
    format!("node:status:{node_id}")
}

/// Broadcast channel for API-proxy mode, scoped by organization
#[must_use]
pub fn org_channel(org_id: &str, node_id: &NodeId) -> String {
    format!("node:status:org:{org_id}:{node_id}")
}

/// Publishing cadence and destinations
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    /// Time between publishes
    pub interval: Duration,
    /// Run the keep-alive every this many ticks; 0 disables it
    pub keep_alive_every: u64,
    /// Broadcast channel
    pub channel: String,
    /// Durable stream
    pub stream: String,
    /// Approximate stream cap
    pub stream_max_len: usize,
}

impl TelemetrySettings {
    /// Settings for direct-broker mode
    #[must_use]
    pub fn direct(node_id: &NodeId) -> Self {
        Self::with_channel(node_channel(node_id))
    }

    /// Settings for API-proxy mode
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `org_id` is not safe to embed in a channel name
    pub fn api(org_id: &str, node_id: &NodeId) -> Result<Self> {
        if !NodeId::is_valid(org_id) {
            return Err(Error::Validation(format!("invalid org id {org_id:?}")));
        }
        Ok(Self::with_channel(org_channel(org_id, node_id)))
    }

    fn with_channel(channel: String) -> Self {
        Self {
            interval: Duration::from_secs(30),
            keep_alive_every: 2,
            channel,
            stream: STATUS_STREAM.to_string(),
            stream_max_len: STATUS_STREAM_MAX_LEN,
        }
    }
}

/// Periodic status publisher
pub struct TelemetryPublisher {
    publisher: Arc<dyn Publisher>,
    collector: Arc<dyn StatusCollector>,
    keep_alive: Option<Arc<dyn MeshKeepAlive>>,
    node_id: NodeId,
    device_code: DeviceCode,
    settings: TelemetrySettings,
}

impl std::fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("node_id", &self.node_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TelemetryPublisher {
    /// Create a publisher
    #[must_use]
    pub fn new(
        publisher: Arc<dyn Publisher>,
        collector: Arc<dyn StatusCollector>,
        node_id: NodeId,
        device_code: DeviceCode,
        settings: TelemetrySettings,
    ) -> Self {
        Self {
            publisher,
            collector,
            keep_alive: None,
            node_id,
            device_code,
            settings,
        }
    }

    /// Attach the mesh keep-alive collaborator
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Arc<dyn MeshKeepAlive>) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Publishing settings
    #[must_use]
    pub const fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    /// Collect and publish one snapshot
    ///
    /// # Errors
    ///
    /// Returns error if collection or the broadcast publish fails. A failed
    /// stream append is logged and does not fail the call.
    pub async fn publish_once(&self) -> Result<StatusSnapshot> {
        let snapshot =
            StatusSnapshot::collect(self.collector.as_ref(), &self.node_id, &self.device_code)
                .await?;
        let payload = serde_json::to_string(&snapshot)?;

        tracing::debug!(channel = %self.settings.channel, bytes = payload.len(), "publishing status");
        self.publisher
            .publish(&self.settings.channel, &payload)
            .await?;

        let fields = snapshot.stream_fields(payload);
        if let Err(e) = self
            .publisher
            .append(
                &self.settings.stream,
                &fields,
                Some(self.settings.stream_max_len),
            )
            .await
        {
            tracing::warn!(stream = %self.settings.stream, error = %e, "status stream append failed");
        }

        Ok(snapshot)
    }

    /// Publish immediately, then every interval, until cancelled
    ///
    /// # Errors
    ///
    /// Always returns an error: `Error::Cancelled` on shutdown. Failed ticks
    /// are logged and the loop continues.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            channel = %self.settings.channel,
            interval = ?self.settings.interval,
            "telemetry publisher starting"
        );

        for tick in 0u64.. {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.publish_once().await {
                tracing::warn!(error = %e, "status publish failed");
            }

            let every = self.settings.keep_alive_every;
            if tick > 0 && every > 0 && tick % every == 0 {
                if let Some(keep_alive) = &self.keep_alive {
                    if let Err(e) = keep_alive.keep_alive().await {
                        tracing::warn!(error = %e, "mesh keep-alive failed");
                    }
                }
            }
        }

        Err(Error::Cancelled)
    }
}
