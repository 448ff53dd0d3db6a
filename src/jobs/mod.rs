//! Job model and dispatch boundary
//!
//! A stream record decodes into a [`Job`] whose [`JobKind`] selects the
//! handler from a [`HandlerRegistry`]. Handlers report a three-valued
//! [`HandlerOutcome`] so the consumer knows whether to acknowledge.

pub mod config;
pub mod decode;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use config::ConfigJobHandler;
pub use decode::{decode_record, device_config_source};

/// Decoded JSON payload of a job
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Job types this node can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Local LLM completion; the payload names the backend
    LlmInference,
    /// Completion on the vLLM backend
    VllmInference,
    /// Completion on the Ollama backend
    OllamaInference,
    /// Completion on the llama.cpp backend
    LlamaCppInference,
    /// Pull a model into the Ollama backend
    OllamaPull,
    /// Apply device configuration pushed by the control plane
    ApplyDeviceConfig,
}

impl JobKind {
    /// Every kind, in registration order
    pub const ALL: [Self; 6] = [
        Self::LlmInference,
        Self::VllmInference,
        Self::OllamaInference,
        Self::LlamaCppInference,
        Self::OllamaPull,
        Self::ApplyDeviceConfig,
    ];

    /// Wire tag carried in the record's `type` field
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LlmInference => "llm_inference",
            Self::VllmInference => "VLLM_INFERENCE",
            Self::OllamaInference => "OLLAMA_INFERENCE",
            Self::LlamaCppInference => "LLAMACPP_INFERENCE",
            Self::OllamaPull => "OLLAMA_PULL",
            Self::ApplyDeviceConfig => "APPLY_DEVICE_CONFIG",
        }
    }

    /// Backend an inference kind is tied to
    #[must_use]
    pub const fn pinned_backend(self) -> Option<&'static str> {
        match self {
            Self::VllmInference => Some("vllm"),
            Self::OllamaInference => Some("ollama"),
            Self::LlamaCppInference => Some("llamacpp"),
            Self::LlmInference | Self::OllamaPull | Self::ApplyDeviceConfig => None,
        }
    }

    /// Parse a wire tag
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work decoded from a stream record
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Producer-assigned job ID (falls back to the record ID)
    pub id: String,
    /// Handler selector
    pub kind: JobKind,
    /// Parsed `payload` field; empty if absent or not a JSON object
    pub payload: Payload,
    /// The record's raw fields, for handlers that need producer-specific keys
    pub fields: BTreeMap<String, String>,
}

impl Job {
    /// String value of a payload key
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Result of handling one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Fully handled; acknowledge
    Success,
    /// Retrying cannot help (malformed payload, unknown backend); acknowledge and drop
    Permanent(String),
    /// May succeed on redelivery (backend down, I/O failure); leave unacknowledged
    Transient(String),
}

impl HandlerOutcome {
    /// Whether the record should be acknowledged
    #[must_use]
    pub const fn should_ack(&self) -> bool {
        matches!(self, Self::Success | Self::Permanent(_))
    }

    /// Short label for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Permanent(_) => "permanent_failure",
            Self::Transient(_) => "transient_failure",
        }
    }
}

/// Executes one kind of job
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle a job
    ///
    /// Handlers may see the same job more than once and must tolerate it.
    async fn handle(&self, job: &Job) -> HandlerOutcome;
}

/// Maps job kinds to their handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing one for `kind`
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::debug!(kind = %kind, "replaced job handler");
        }
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Handler for `kind`
    #[must_use]
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds
    #[must_use]
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    /// Whether no handlers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
