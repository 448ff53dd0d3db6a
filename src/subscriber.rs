//! Real-time configuration subscriber
//!
//! Listens on `config:node:<nodeId>` for `config_updated` messages and hands
//! each validated update to the configuration-apply collaborator. Runs until
//! cancelled, reconnecting with exponential backoff whenever the subscription
//! is lost. A bad message is logged and skipped; only connection-level
//! failures trigger a reconnect.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::broker::{ChannelConnector, MessageStream};
use crate::manifest::ConfigApplier;
use crate::node_id::NodeId;
use crate::{Error, Result};

/// Message type accepted on the config channel
pub const CONFIG_UPDATED: &str = "config_updated";

/// Hard limits on attacker-controlled config fields
pub mod limits {
    /// Maximum device name length in bytes
    pub const DEVICE_NAME_LEN: usize = 256;
    /// Maximum number of services
    pub const SERVICES: usize = 50;
    /// Maximum number of custom tags
    pub const CUSTOM_TAGS: usize = 100;
    /// Maximum number of SSH users
    pub const SSH_USERS: usize = 50;
    /// Maximum number of SSH device keys
    pub const SSH_KEYS: usize = 50;
    /// Maximum length of a service name, tag, user name, status or timestamp
    pub const SHORT_STRING_LEN: usize = 64;
    /// Maximum length of one SSH public key
    pub const SSH_KEY_LEN: usize = 16 * 1024;
}

/// Device configuration pushed by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub device_name: String,
    pub services: Vec<String>,
    pub auto_start_services: bool,
    pub ssh_enabled: bool,
    pub ssh_allowed_users: Vec<String>,
    pub ssh_device_keys: Vec<String>,
    pub share_inference_with_org: bool,
    pub visible_to_team: bool,
    pub custom_tags: Vec<String>,
    pub health_monitoring_enabled: bool,
    pub alert_on_offline: bool,
    pub alert_on_high_temp: bool,
    pub status: String,
    pub updated_at: String,
}

fn check_string(field: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(Error::Validation(format!(
            "{field} too long: {} > {max}",
            value.len()
        )));
    }
    Ok(())
}

fn check_list(field: &str, values: &[String], max_items: usize, max_len: usize) -> Result<()> {
    if values.len() > max_items {
        return Err(Error::Validation(format!(
            "too many {field}: {} > {max_items}",
            values.len()
        )));
    }
    for value in values {
        check_string(field, value, max_len)?;
    }
    Ok(())
}

impl ConfigUpdate {
    /// Enforce every size limit
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first field over its limit
    pub fn validate(&self) -> Result<()> {
        check_string("deviceName", &self.device_name, limits::DEVICE_NAME_LEN)?;
        check_string("status", &self.status, limits::SHORT_STRING_LEN)?;
        check_string("updatedAt", &self.updated_at, limits::SHORT_STRING_LEN)?;
        check_list(
            "services",
            &self.services,
            limits::SERVICES,
            limits::SHORT_STRING_LEN,
        )?;
        check_list(
            "customTags",
            &self.custom_tags,
            limits::CUSTOM_TAGS,
            limits::SHORT_STRING_LEN,
        )?;
        check_list(
            "sshAllowedUsers",
            &self.ssh_allowed_users,
            limits::SSH_USERS,
            limits::SHORT_STRING_LEN,
        )?;
        check_list(
            "sshDeviceKeys",
            &self.ssh_device_keys,
            limits::SSH_KEYS,
            limits::SSH_KEY_LEN,
        )
    }
}

/// Envelope received on the config channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: String,
    #[serde(default)]
    pub config: ConfigUpdate,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Channel carrying config updates for `node_id`
#[must_use]
pub fn channel_for(node_id: &NodeId) -> String {
    format!("config:node:{node_id}")
}

/// Reconnecting subscriber for one node's config channel
pub struct ConfigSubscriber {
    connector: Arc<dyn ChannelConnector>,
    applier: Arc<dyn ConfigApplier>,
    node_id: NodeId,
    channel: String,
    policy: BackoffPolicy,
}

impl std::fmt::Debug for ConfigSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSubscriber")
            .field("channel", &self.channel)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConfigSubscriber {
    /// Create a subscriber for `node_id`
    #[must_use]
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        applier: Arc<dyn ConfigApplier>,
        node_id: NodeId,
    ) -> Self {
        Self {
            connector,
            applier,
            channel: channel_for(&node_id),
            node_id,
            policy: BackoffPolicy::SUBSCRIBER,
        }
    }

    /// Override the reconnect backoff
    #[must_use]
    pub const fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Channel this subscriber listens on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run until cancelled
    ///
    /// # Errors
    ///
    /// Always returns an error: `Error::Cancelled` on shutdown. Connection
    /// failures are retried, never returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.policy.start();
        tracing::info!(channel = %self.channel, "config subscriber starting");

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let lost = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                subscribed = self.connector.subscribe(&self.channel) => match subscribed {
                    Ok(messages) => {
                        backoff.reset();
                        tracing::info!(channel = %self.channel, "subscribed to config channel");
                        self.consume(messages, &cancel).await
                    }
                    Err(e) => e,
                },
            };

            if lost.is_cancelled() {
                return Err(lost);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                channel = %self.channel,
                error = %lost,
                retry_in = ?delay,
                "config subscription lost"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Read messages until the subscription fails; returns why it ended
    async fn consume(&self, mut messages: MessageStream, cancel: &CancellationToken) -> Error {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Error::Cancelled,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    if let Err(e) = self.handle_message(&raw).await {
                        tracing::warn!(channel = %self.channel, error = %e, "ignoring config message");
                    }
                }
                Some(Err(e)) => return e,
                None => return Error::Broker("subscription closed".to_string()),
            }
        }
    }

    /// Parse, validate and apply one message
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed, mistyped or misaddressed
    /// messages, `Error::Validation` for limit violations, and the applier's
    /// error if applying fails
    pub async fn handle_message(&self, raw: &str) -> Result<()> {
        let message: ConfigMessage = serde_json::from_str(raw)
            .map_err(|e| Error::Protocol(format!("malformed config message: {e}")))?;

        if message.kind != CONFIG_UPDATED {
            return Err(Error::Protocol(format!(
                "unknown message type {:?}",
                message.kind
            )));
        }

        if message.node_id != self.node_id.as_str() {
            return Err(Error::Protocol(format!(
                "config message for node {:?}, expected {}",
                message.node_id, self.node_id
            )));
        }

        message.config.validate()?;

        tracing::info!(node_id = %self.node_id, "config update received");
        let summary = self.applier.apply(&message.config).await?;
        tracing::info!(node_id = %self.node_id, %summary, "config update applied");
        Ok(())
    }
}
