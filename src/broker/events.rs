//! Per-job progress events
//!
//! Published to the broadcast channel `stream:v1:<jobId>` so the control
//! plane can relay progressive output to whoever submitted the job.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Publisher;
use crate::Result;

/// Event schema version
pub const EVENT_VERSION: &str = "1.0";

/// Kind of job progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Chunk,
    End,
    Error,
}

/// Wire shape of a job progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl StreamEvent {
    fn new(kind: EventKind, job_id: &str, data: serde_json::Value) -> Self {
        Self {
            version: EVENT_VERSION.to_string(),
            kind,
            job_id: job_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        }
    }
}

/// Channel a job's events are published on
#[must_use]
pub fn channel_for(job_id: &str) -> String {
    format!("stream:v1:{job_id}")
}

/// Event emitter for one job
///
/// Chunk indices start at 0 and only advance after a chunk was published,
/// so the sequence seen by subscribers has no gaps.
pub struct JobEvents {
    publisher: Arc<dyn Publisher>,
    job_id: String,
    channel: String,
    next_index: u64,
}

impl std::fmt::Debug for JobEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEvents")
            .field("job_id", &self.job_id)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl JobEvents {
    /// Create an emitter for `job_id`
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, job_id: &str) -> Self {
        Self {
            publisher,
            channel: channel_for(job_id),
            job_id: job_id.to_string(),
            next_index: 0,
        }
    }

    /// Job this emitter publishes for
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Number of chunks published so far
    #[must_use]
    pub const fn chunks_sent(&self) -> u64 {
        self.next_index
    }

    async fn emit(&self, kind: EventKind, data: serde_json::Value) -> Result<()> {
        let event = StreamEvent::new(kind, &self.job_id, data);
        let message = serde_json::to_string(&event)?;
        self.publisher.publish(&self.channel, &message).await
    }

    /// Announce that processing began
    ///
    /// Best-effort: a failure is logged and not returned.
    pub async fn start(&self, message: &str) {
        if let Err(e) = self.emit(EventKind::Start, json!({ "message": message })).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to publish start event");
        }
    }

    /// Publish the next chunk
    ///
    /// # Errors
    ///
    /// Returns error if the publish fails; the index is not consumed
    pub async fn chunk(&mut self, content: &str) -> Result<()> {
        let index = self.next_index;
        self.emit(EventKind::Chunk, json!({ "content": content, "index": index }))
            .await?;
        self.next_index += 1;
        Ok(())
    }

    /// Publish the terminal result
    ///
    /// # Errors
    ///
    /// Returns error if the result cannot be serialized or published
    pub async fn end<T: Serialize + Sync>(&self, result: &T) -> Result<()> {
        let result = serde_json::to_value(result)?;
        self.emit(EventKind::End, json!({ "result": result })).await
    }

    /// Publish a terminal failure
    ///
    /// Best-effort: a failure to publish is logged and not returned.
    pub async fn error(&self, message: &str, recoverable: bool) {
        let data = json!({ "error": message, "recoverable": recoverable });
        if let Err(e) = self.emit(EventKind::Error, data).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to publish error event");
        }
    }
}
