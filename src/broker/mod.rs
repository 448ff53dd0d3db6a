//! Broker capabilities consumed by the agent
//!
//! Three seams, each implemented by the direct Redis transport and (where the
//! control-plane proxy supports it) by the authenticated HTTP API transport:
//!
//! - [`StreamBroker`]: consumer-group reads and acknowledgments
//! - [`Publisher`]: broadcast publish and durable stream append
//! - [`ChannelConnector`]: live subscriptions to a broadcast channel

pub mod api;
pub mod events;
pub mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

pub use self::api::ApiClient;
pub use self::events::{EventKind, JobEvents, StreamEvent};
pub use self::redis::RedisBroker;

/// One record read from a stream
///
/// Owned by the broker; the agent only reads the fields and acknowledges
/// by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Broker-assigned offset (e.g. `1700000000000-0`)
    pub id: String,
    /// Stream the record was read from
    pub stream: String,
    /// Flat string fields
    pub fields: BTreeMap<String, String>,
}

impl StreamRecord {
    /// Look up a field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Which part of a consumer group to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Records already delivered to this consumer but never acknowledged
    Pending,
    /// Records never delivered to any consumer in the group
    New,
}

/// Consumer-group access to durable streams
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create the consumer group if it does not already exist
    ///
    /// "Group already exists" is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Claim at most one record from any of `streams`
    ///
    /// Blocks up to `block` for new records. Returns `Ok(None)` on an empty
    /// poll.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        block: Duration,
    ) -> Result<Option<StreamRecord>>;

    /// Acknowledge a record, removing it from the group's pending list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// How many times a pending record has been delivered
    ///
    /// Transports that cannot report this return 0.
    async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Result<u64>;

    /// Take over one record pending in `group` on any of `streams` that has
    /// been idle for at least `min_idle`, whichever consumer holds it
    ///
    /// The claimed record counts as delivered again. Transports that cannot
    /// claim return `Ok(None)`.
    async fn claim_stale(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<StreamRecord>>;
}

/// Publishing to broadcast channels and durable streams
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message to a broadcast channel
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Append a record to a stream, trimming to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<()>;
}

/// Stream of raw message payloads from a live subscription
///
/// An `Err` item or the end of the stream means the subscription is gone.
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Live subscriptions to broadcast channels
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connect, subscribe to `channel`, and wait for the confirmation
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}

/// Mask the password in a broker URL for logging
///
/// `redis://:secret@host:6379` becomes `redis://:***@host:6379`.
#[must_use]
pub fn mask_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) if raw.starts_with("redis://") => "redis://***".to_string(),
        Err(_) => "***".to_string(),
    }
}
