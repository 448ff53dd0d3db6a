//! Inference backend adapters
//!
//! Each adapter knows its endpoints, how to shape a request body, and how to
//! read both the single-shot and the streamed response. The HTTP exchange
//! itself lives in the dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::lines::Framing;
use super::request::{InferenceRequest, InferenceResult, Usage};
use crate::{Error, Result};

/// Default vLLM server
pub const DEFAULT_VLLM_URL: &str = "http://localhost:8000";

/// Default Ollama server
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default llama.cpp server
pub const DEFAULT_LLAMACPP_URL: &str = "http://localhost:8080";

/// One incremental unit of a streamed response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamUnit {
    /// Text fragment; may be empty
    pub text: String,
    /// The backend signalled completion
    pub done: bool,
    /// Why generation stopped, if reported
    pub finish_reason: Option<String>,
    /// Token accounting, if reported
    pub usage: Option<Usage>,
}

/// An inference engine reachable over HTTP
pub trait InferenceBackend: Send + Sync {
    /// Registry name (`vllm`, `ollama`, `llamacpp`)
    fn name(&self) -> &'static str;

    /// URL polled until the backend answers with 2xx
    fn readiness_url(&self) -> String;

    /// Completion endpoint and JSON body for a request
    fn request(&self, req: &InferenceRequest) -> (String, Value);

    /// Framing of the streamed response
    fn framing(&self) -> Framing;

    /// Parse one streamed payload; `None` skips it
    fn parse_unit(&self, data: &str) -> Option<StreamUnit>;

    /// Parse a non-streamed response body
    ///
    /// # Errors
    ///
    /// Returns `Error::Backend` if the body is not the expected shape
    fn parse_response(&self, body: &[u8]) -> Result<InferenceResult>;
}

fn base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn bad_response(backend: &str, e: impl fmt::Display) -> Error {
    Error::Backend(format!("failed to parse {backend} response: {e}"))
}

/// Insert optional sampling parameters shared by the OpenAI-style bodies
fn sampling(body: &mut Value, req: &InferenceRequest) {
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if !req.stop.is_empty() {
        body["stop"] = json!(req.stop);
    }
}

// vLLM, OpenAI-compatible API

/// vLLM server
#[derive(Debug, Clone)]
pub struct Vllm {
    base_url: String,
}

impl Vllm {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base(base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<OpenAiContent>,
    #[serde(default)]
    delta: Option<OpenAiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiContent {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChoice {
    fn into_text(self) -> (String, Option<String>) {
        let text = self
            .text
            .or_else(|| self.message.and_then(|m| m.content))
            .or_else(|| self.delta.and_then(|d| d.content))
            .unwrap_or_default();
        (text, self.finish_reason)
    }
}

impl InferenceBackend for Vllm {
    fn name(&self) -> &'static str {
        "vllm"
    }

    fn readiness_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    fn request(&self, req: &InferenceRequest) -> (String, Value) {
        let (path, mut body) = if req.is_chat() {
            (
                "/v1/chat/completions",
                json!({ "model": req.model, "messages": req.messages }),
            )
        } else {
            (
                "/v1/completions",
                json!({ "model": req.model, "prompt": req.prompt }),
            )
        };
        body["max_tokens"] = json!(req.max_tokens());
        body["stream"] = json!(req.stream);
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        sampling(&mut body, req);

        (format!("{}{path}", self.base_url), body)
    }

    fn framing(&self) -> Framing {
        Framing::Sse {
            sentinel: Some("[DONE]"),
        }
    }

    fn parse_unit(&self, data: &str) -> Option<StreamUnit> {
        let chunk: OpenAiResponse = serde_json::from_str(data).ok()?;
        let usage = chunk.usage;
        let (text, finish_reason) = chunk
            .choices
            .into_iter()
            .next()
            .map(OpenAiChoice::into_text)
            .unwrap_or_default();

        Some(StreamUnit {
            text,
            // With usage reporting on, the finish chunk is followed by a
            // usage-only chunk, so only [DONE] ends the stream
            done: false,
            finish_reason,
            usage,
        })
    }

    fn parse_response(&self, body: &[u8]) -> Result<InferenceResult> {
        let response: OpenAiResponse =
            serde_json::from_slice(body).map_err(|e| bad_response("vllm", e))?;
        let usage = response.usage.unwrap_or_default();
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Backend("vllm returned no choices".to_string()))?;
        let (text, finish_reason) = choice.into_text();

        Ok(InferenceResult {
            content: text.trim().to_string(),
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
            model: String::new(),
        })
    }
}

// Ollama native API

/// Ollama server
#[derive(Debug, Clone)]
pub struct Ollama {
    base_url: String,
}

impl Ollama {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base(base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<OpenAiContent>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaChunk {
    fn into_unit(self) -> StreamUnit {
        let usage = (self.prompt_eval_count.is_some() || self.eval_count.is_some()).then(|| {
            Usage::new(
                self.prompt_eval_count.unwrap_or(0),
                self.eval_count.unwrap_or(0),
            )
        });
        let text = self
            .response
            .or_else(|| self.message.and_then(|m| m.content))
            .unwrap_or_default();

        StreamUnit {
            text,
            done: self.done,
            finish_reason: self.done_reason,
            usage,
        }
    }
}

impl InferenceBackend for Ollama {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn readiness_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn request(&self, req: &InferenceRequest) -> (String, Value) {
        let (path, mut body) = if req.is_chat() {
            (
                "/api/chat",
                json!({ "model": req.model, "messages": req.messages }),
            )
        } else {
            (
                "/api/generate",
                json!({ "model": req.model, "prompt": req.prompt }),
            )
        };
        body["stream"] = json!(req.stream);

        let mut options = json!({ "num_predict": req.max_tokens() });
        sampling(&mut options, req);
        body["options"] = options;

        (format!("{}{path}", self.base_url), body)
    }

    fn framing(&self) -> Framing {
        Framing::Ndjson
    }

    fn parse_unit(&self, data: &str) -> Option<StreamUnit> {
        serde_json::from_str::<OllamaChunk>(data)
            .ok()
            .map(OllamaChunk::into_unit)
    }

    fn parse_response(&self, body: &[u8]) -> Result<InferenceResult> {
        let chunk: OllamaChunk =
            serde_json::from_slice(body).map_err(|e| bad_response("ollama", e))?;
        let unit = chunk.into_unit();

        Ok(InferenceResult {
            content: unit.text,
            finish_reason: unit.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: unit.usage.unwrap_or_default(),
            model: String::new(),
        })
    }
}

// llama.cpp server

/// llama.cpp HTTP server
#[derive(Debug, Clone)]
pub struct LlamaCpp {
    base_url: String,
}

impl LlamaCpp {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base(base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LlamaCppChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    stopped_limit: bool,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
}

impl LlamaCppChunk {
    fn into_unit(self) -> StreamUnit {
        let usage = self
            .stop
            .then(|| {
                Usage::new(
                    self.tokens_evaluated.unwrap_or(0),
                    self.tokens_predicted.unwrap_or(0),
                )
            });
        let finish_reason = self
            .stop
            .then(|| if self.stopped_limit { "length" } else { "stop" }.to_string());

        StreamUnit {
            text: self.content,
            done: self.stop,
            finish_reason,
            usage,
        }
    }
}

/// Flatten chat messages into a plain completion prompt
fn render_chat(req: &InferenceRequest) -> String {
    if !req.is_chat() {
        return req.prompt.clone();
    }
    let mut prompt = String::new();
    for message in &req.messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

impl InferenceBackend for LlamaCpp {
    fn name(&self) -> &'static str {
        "llamacpp"
    }

    fn readiness_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    fn request(&self, req: &InferenceRequest) -> (String, Value) {
        let mut body = json!({
            "prompt": render_chat(req),
            "n_predict": req.max_tokens(),
            "stream": req.stream,
        });
        sampling(&mut body, req);

        (format!("{}/completion", self.base_url), body)
    }

    fn framing(&self) -> Framing {
        Framing::Sse { sentinel: None }
    }

    fn parse_unit(&self, data: &str) -> Option<StreamUnit> {
        serde_json::from_str::<LlamaCppChunk>(data)
            .ok()
            .map(LlamaCppChunk::into_unit)
    }

    fn parse_response(&self, body: &[u8]) -> Result<InferenceResult> {
        let mut chunk: LlamaCppChunk =
            serde_json::from_slice(body).map_err(|e| bad_response("llamacpp", e))?;
        // Single-shot responses are always final
        chunk.stop = true;
        let unit = chunk.into_unit();

        Ok(InferenceResult {
            content: unit.text,
            finish_reason: unit.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: unit.usage.unwrap_or_default(),
            model: String::new(),
        })
    }
}

/// Backends by registry name
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn InferenceBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three built-in backends
    #[must_use]
    pub fn standard(vllm_url: &str, ollama_url: &str, llamacpp_url: &str) -> Self {
        Self::new()
            .with(Arc::new(Vllm::new(vllm_url)))
            .with(Arc::new(Ollama::new(ollama_url)))
            .with(Arc::new(LlamaCpp::new(llamacpp_url)))
    }

    /// Register a backend under its own name
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(backend.name(), backend);
        self
    }

    /// Look up a backend
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.backends.get(name).cloned()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
