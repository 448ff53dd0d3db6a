//! Direct Redis transport
//!
//! Consumer groups on Redis Streams, Pub/Sub for broadcast channels. The
//! multiplexed connection is opened lazily and dropped on I/O failure so the
//! next call reconnects.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, IntoConnectionInfo, RedisResult};
use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use super::{ChannelConnector, MessageStream, Publisher, ReadFrom, StreamBroker, StreamRecord};
use crate::{Error, Result};

/// Extra time allowed on top of the server-side block before a read is
/// considered hung
const READ_GRACE: Duration = Duration::from_secs(5);

/// Redis-backed broker
pub struct RedisBroker {
    client: ::redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    display_url: String,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("url", &self.display_url)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Create a broker for `url`, optionally overriding the password
    ///
    /// No connection is made until the first command.
    ///
    /// # Errors
    ///
    /// Returns error if the URL cannot be parsed
    pub fn open(url: &str, password: Option<&SecretString>) -> Result<Self> {
        let mut info = url.into_connection_info()?;
        if let Some(pw) = password {
            info.redis.password = Some(pw.expose_secret().to_string());
        }

        Ok(Self {
            client: ::redis::Client::open(info)?,
            conn: Mutex::new(None),
            display_url: super::mask_url(url),
        })
    }

    /// URL with the password masked
    #[must_use]
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Verify the server is reachable
    ///
    /// # Errors
    ///
    /// Returns error if the connection or `PING` fails
    pub async fn ping(&self) -> Result<()> {
        self.run(|mut conn| async move {
            let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Broker(format!("failed to connect to {}: {e}", self.display_url)))?;
        tracing::debug!(url = %self.display_url, "redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    /// Run a command, dropping the cached connection on transport failure
    async fn run<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
    {
        let conn = self.connection().await?;
        match f(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    self.reset().await;
                }
                Err(Error::Broker(e.to_string()))
            }
        }
    }
}

/// Convert one stream entry; non-string field values are skipped
fn to_record(stream: String, entry: StreamId) -> StreamRecord {
    let fields: BTreeMap<String, String> = entry
        .map
        .iter()
        .filter_map(|(k, v)| {
            ::redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();
    StreamRecord {
        id: entry.id,
        stream,
        fields,
    }
}

/// Convert the first non-empty entry of an `XREADGROUP` reply
fn first_record(reply: StreamReadReply) -> Option<StreamRecord> {
    reply.keys.into_iter().find_map(|key| {
        let stream = key.key;
        key.ids.into_iter().next().map(|entry| to_record(stream, entry))
    })
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let created = self
            .run(|mut conn| async move {
                let res: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
                match res {
                    Ok(()) => Ok(true),
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if created {
            tracing::info!(stream, group, "created consumer group");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        block: Duration,
    ) -> Result<Option<StreamRecord>> {
        let start_id = match from {
            ReadFrom::Pending => "0",
            ReadFrom::New => ">",
        };
        let ids = vec![start_id; streams.len()];
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block_ms);

        let read = self.run(|mut conn| async move {
            conn.xread_options(streams, &ids, &opts).await
        });

        match tokio::time::timeout(block + READ_GRACE, read).await {
            Ok(reply) => {
                let reply: Option<StreamReadReply> = reply?;
                Ok(reply.and_then(first_record))
            }
            Err(_) => {
                self.reset().await;
                Err(Error::Broker(format!(
                    "stream read did not return within {:?}",
                    block + READ_GRACE
                )))
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.run(|mut conn| async move {
            let _: i64 = conn.xack(stream, group, &[id]).await?;
            Ok(())
        })
        .await
    }

    async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        let reply: StreamPendingCountReply = self
            .run(|mut conn| async move { conn.xpending_count(stream, group, id, id, 1).await })
            .await?;

        Ok(reply
            .ids
            .first()
            .map_or(0, |p| u64::try_from(p.times_delivered).unwrap_or(u64::MAX)))
    }

    async fn claim_stale(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<StreamRecord>> {
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        for stream in streams {
            let reply: StreamAutoClaimReply = self
                .run(|mut conn| async move {
                    conn.xautoclaim_options(
                        stream.as_str(),
                        group,
                        consumer,
                        min_idle_ms,
                        "0-0",
                        StreamAutoClaimOptions::default().count(1),
                    )
                    .await
                })
                .await?;

            if let Some(entry) = reply.claimed.into_iter().next() {
                return Ok(Some(to_record(stream.clone(), entry)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Publisher for RedisBroker {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.run(|mut conn| async move {
            let _: i64 = conn.publish(channel, message).await?;
            Ok(())
        })
        .await
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<()> {
        self.run(|mut conn| async move {
            let _: String = match max_len {
                Some(n) => {
                    conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", fields)
                        .await?
                }
                None => conn.xadd(stream, "*", fields).await?,
            };
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ChannelConnector for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Broker(format!("failed to connect to {}: {e}", self.display_url)))?;

        // Resolves once the server confirms the subscription
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::Broker(format!("failed to subscribe to {channel}: {e}")))?;

        let messages = pubsub
            .into_on_message()
            .map(|msg| Ok(String::from_utf8_lossy(msg.get_payload_bytes()).into_owned()));

        Ok(messages.boxed())
    }
}
