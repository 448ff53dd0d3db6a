//! Authenticated HTTP proxy transport
//!
//! Devices that were issued a `device_api_token` talk to the broker through
//! the control plane instead of holding Redis credentials. The proxy exposes
//! consume/acknowledge for job queues, publish, and stream append. It has no
//! subscribe endpoint, so it implements [`StreamBroker`] and [`Publisher`]
//! but not [`ChannelConnector`](super::ChannelConnector).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Publisher, ReadFrom, StreamBroker, StreamRecord};
use crate::{Error, Result};

/// Default request timeout for non-blocking calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time allowed on top of the server-side block
const READ_GRACE: Duration = Duration::from_secs(5);

/// HTTP client for the control-plane broker proxy
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: SecretString,
    client: reqwest::Client,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ConsumeRequest<'a> {
    queue: &'a str,
    consumer_group: &'a str,
    consumer: &'a str,
    count: u32,
    block_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ConsumeResponse {
    #[serde(default)]
    messages: Vec<ProxyMessage>,
}

#[derive(Debug, Deserialize)]
struct ProxyMessage {
    id: String,
    #[serde(default)]
    data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AcknowledgeRequest<'a> {
    queue: &'a str,
    consumer_group: &'a str,
    message_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct AcknowledgeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    channel: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamAddRequest<'a> {
    stream: &'a str,
    values: BTreeMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_len: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    approx: bool,
}

/// Error body returned by the proxy
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ApiClient {
    /// Create a client for `base_url` authenticated with `token`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, token: SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("citadel/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Base URL requests are sent to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Verify the proxy is reachable and the token is accepted
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the proxy rejects the token
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/fabric/redis/ping", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;

        Self::check(response).await.map(drop)
    }

    async fn post<B, T>(&self, path: &str, body: &B, timeout: Option<Duration>) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Default,
    {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        tracing::trace!(path, "api request");
        let response = request.send().await?;
        let bytes = Self::check(response).await?;

        if bytes.is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Turn non-success responses into `Error::Api`, returning the body otherwise
    async fn check(response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(body);
        }

        let message = match serde_json::from_slice::<ApiErrorBody>(&body) {
            Ok(err) if !err.error.is_empty() => match err.error_description {
                Some(desc) if !desc.is_empty() => format!("{}: {desc}", err.error),
                _ => err.error,
            },
            _ => String::from_utf8_lossy(&body).into_owned(),
        };

        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Flatten proxy message data to string fields
fn to_record(queue: &str, msg: ProxyMessage) -> StreamRecord {
    let fields = msg
        .data
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect();

    StreamRecord {
        id: msg.id,
        stream: queue.to_string(),
        fields,
    }
}

#[async_trait]
impl StreamBroker for ApiClient {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        // The proxy creates groups on first consume
        tracing::debug!(stream, group, "consumer group managed by api proxy");
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
        // The proxy only serves never-delivered records
        if from == ReadFrom::Pending {
            return Ok(None);
        }

        // One blocking call per queue; the block time is split between them
        let per_queue = block / u32::try_from(streams.len().max(1)).unwrap_or(u32::MAX);
        let block_ms = u64::try_from(per_queue.as_millis()).unwrap_or(u64::MAX);

        for queue in streams {
            let request = ConsumeRequest {
                queue,
                consumer_group: group,
                consumer,
                count: 1,
                block_ms,
            };
            let response: ConsumeResponse = self
                .post(
                    "/api/fabric/redis/jobs/consume",
                    &request,
                    Some(per_queue + READ_GRACE),
                )
                .await?;

            if let Some(msg) = response.messages.into_iter().next() {
                return Ok(Some(to_record(queue, msg)));
            }
        }

        Ok(None)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let request = AcknowledgeRequest {
            queue: stream,
            consumer_group: group,
            message_id: id,
        };
        let response: AcknowledgeResponse = self
            .post("/api/fabric/redis/jobs/acknowledge", &request, None)
            .await?;

        if response.success {
            Ok(())
        } else {
            Err(Error::Broker(format!(
                "acknowledge failed: {}",
                response.message.unwrap_or_default()
            )))
        }
    }

    async fn delivery_count(&self, _stream: &str, _group: &str, _id: &str) -> Result<u64> {
        Ok(0)
    }

    async fn claim_stale(
        &self,
        _streams: &[String],
        _group: &str,
        _consumer: &str,
        _min_idle: Duration,
    ) -> Result<Option<StreamRecord>> {
        Ok(None)
    }
}

#[async_trait]
impl Publisher for ApiClient {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let request = PublishRequest { channel, message };
        let _: serde_json::Value = self
            .post("/api/fabric/redis/pubsub/publish", &request, None)
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<()> {
        let request = StreamAddRequest {
            stream,
            values: fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            max_len,
            approx: max_len.is_some(),
        };
        let _: serde_json::Value = self
            .post("/api/fabric/redis/streams/add", &request, None)
            .await?;
        Ok(())
    }
}
