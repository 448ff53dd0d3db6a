//! Stream record decoding
//!
//! Producers have emitted several record shapes over time. The fields read
//! here are `jobId`, `type`, `payload` (a JSON string) and, for configuration
//! jobs, an optional top-level `config` (also a JSON string).

use super::{Job, JobKind, Payload};
use crate::broker::StreamRecord;
use crate::{Error, Result};

/// Decode a stream record into a job
///
/// The job type comes from the record's `type` field, falling back to
/// `payload.type`. A `payload` that is not a JSON object leaves the job's
/// payload empty; the raw string stays available in [`Job::fields`].
///
/// # Errors
///
/// Returns `Error::Protocol` if the record has no recognizable job type
pub fn decode_record(record: &StreamRecord) -> Result<Job> {
    let payload = record
        .field("payload")
        .and_then(|raw| match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                tracing::debug!(record_id = %record.id, "payload is not a json object");
                None
            }
        })
        .unwrap_or_default();

    let tag = record
        .field("type")
        .filter(|t| !t.is_empty())
        .or_else(|| payload_str(&payload, "type"))
        .ok_or_else(|| Error::Protocol(format!("record {} has no job type", record.id)))?;

    let kind = JobKind::from_tag(tag)
        .ok_or_else(|| Error::Protocol(format!("unknown job type {tag:?}")))?;

    let id = record
        .field("jobId")
        .filter(|id| !id.is_empty())
        .or_else(|| payload_str(&payload, "jobId"))
        .unwrap_or(record.id.as_str())
        .to_string();

    Ok(Job {
        id,
        kind,
        payload,
        fields: record.fields.clone(),
    })
}

fn payload_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Locate the device configuration JSON in a configuration job's fields
///
/// Resolution order, first match wins:
///
/// 1. a top-level `config` field
/// 2. a `config` value embedded in the `payload` JSON object
/// 3. the raw `payload` string itself
///
/// Returns `None` if none of these are present.
#[must_use]
pub fn device_config_source(job: &Job) -> Option<String> {
    if let Some(config) = job.fields.get("config").filter(|c| !c.is_empty()) {
        return Some(config.clone());
    }

    if let Some(embedded) = job.payload.get("config") {
        return Some(match embedded {
            // Some producers double-encode the config as a string
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    job.fields.get("payload").filter(|p| !p.is_empty()).cloned()
}
