//! Normalized inference request and result

use serde::{Deserialize, Serialize};

use crate::jobs::Payload;
use crate::{Error, Result};

/// Token limit applied when the job does not set one
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// One message of a chat-style prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Backend-independent inference request decoded from a job payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl InferenceRequest {
    /// Decode and validate a job payload
    ///
    /// An empty `backend` becomes `default_backend`; a zero `max_tokens`
    /// counts as unset.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the payload has the wrong shape, no
    /// model, or neither a prompt nor messages
    pub fn from_payload(payload: &Payload, default_backend: &str) -> Result<Self> {
        let mut request: Self = serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| Error::Validation(format!("invalid inference payload: {e}")))?;

        if request.model.trim().is_empty() {
            return Err(Error::Validation("model is required".to_string()));
        }
        if request.prompt.is_empty() && request.messages.is_empty() {
            return Err(Error::Validation(
                "prompt or messages is required".to_string(),
            ));
        }

        request.backend = request.backend.trim().to_ascii_lowercase();
        if request.backend.is_empty() {
            request.backend = default_backend.to_string();
        }
        if request.max_tokens == Some(0) {
            request.max_tokens = None;
        }

        Ok(request)
    }

    /// Token limit to send to the backend
    #[must_use]
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// Whether the request uses chat messages instead of a raw prompt
    #[must_use]
    pub fn is_chat(&self) -> bool {
        !self.messages.is_empty()
    }
}

/// Token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Build usage from prompt and completion counts
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Normalized result published in the job's end event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}
