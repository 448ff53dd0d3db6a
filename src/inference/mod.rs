//! Local LLM inference dispatch
//!
//! Turns an inference job into a request against one of the node's
//! inference backends and relays the output as job stream events: ordered
//! chunks while the backend generates, then exactly one `end` event with the
//! accumulated result.

pub mod backends;
pub mod lines;
pub mod pull;
pub mod request;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

pub use backends::{BackendRegistry, InferenceBackend, LlamaCpp, Ollama, StreamUnit, Vllm};
pub use pull::{OllamaPullHandler, PullResult};
pub use request::{ChatMessage, InferenceRequest, InferenceResult, Usage};

use crate::broker::{JobEvents, Publisher};
use crate::jobs::{HandlerOutcome, Job, JobHandler, Payload};
use crate::{Error, Result};
use lines::{Frame, LineBuffer};

/// Backend used when a job does not name one
pub const DEFAULT_BACKEND: &str = "vllm";

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Backend used when the job does not name one
    pub default_backend: String,
    /// Time between readiness probes
    pub readiness_interval: Duration,
    /// Give up on a backend that is not ready after this long
    pub readiness_max_wait: Duration,
    /// Upper bound on one completion request, body included
    pub request_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_backend: DEFAULT_BACKEND.to_string(),
            readiness_interval: Duration::from_secs(1),
            readiness_max_wait: Duration::from_secs(60),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// Text and accounting gathered from a streamed response
#[derive(Debug, Default)]
struct Accumulated {
    content: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

/// Executes inference requests against the registered backends
#[derive(Debug)]
pub struct InferenceDispatcher {
    client: reqwest::Client,
    backends: BackendRegistry,
    settings: DispatcherSettings,
}

impl InferenceDispatcher {
    /// Create a dispatcher
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(backends: BackendRegistry, settings: DispatcherSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("citadel/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            backends,
            settings,
        })
    }

    /// Dispatcher settings
    #[must_use]
    pub const fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Run one inference job, publishing its chunks and end event to `events`
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if the payload is not a usable request
    /// - `Error::UnsupportedBackend` if the named backend is unknown
    /// - `Error::Backend` if the backend never became ready, answered with
    ///   a non-2xx status, sent an unreadable response or closed a stream
    ///   before signalling completion
    /// - transport or publish errors as they occur
    pub async fn execute(
        &self,
        payload: &Payload,
        events: &mut JobEvents,
    ) -> Result<InferenceResult> {
        let request = InferenceRequest::from_payload(payload, &self.settings.default_backend)?;
        self.dispatch(request, events).await
    }

    /// Like [`execute`](Self::execute), but always on `backend`
    ///
    /// Any `backend` named in the payload is ignored.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute)
    pub async fn execute_on(
        &self,
        backend: &str,
        payload: &Payload,
        events: &mut JobEvents,
    ) -> Result<InferenceResult> {
        let mut request = InferenceRequest::from_payload(payload, backend)?;
        request.backend = backend.to_string();
        self.dispatch(request, events).await
    }

    async fn dispatch(
        &self,
        request: InferenceRequest,
        events: &mut JobEvents,
    ) -> Result<InferenceResult> {
        let backend = self
            .backends
            .get(&request.backend)
            .ok_or_else(|| Error::UnsupportedBackend(request.backend.clone()))?;

        self.wait_ready(backend.as_ref()).await?;

        let (url, body) = backend.request(&request);
        tracing::debug!(
            job_id = %events.job_id(),
            backend = backend.name(),
            %url,
            model = %request.model,
            stream = request.stream,
            "sending inference request"
        );

        let response = self
            .client
            .post(&url)
            .timeout(self.settings.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!(
                "{} returned {status}: {body}",
                backend.name()
            )));
        }

        let mut result = if request.stream {
            Self::relay_stream(backend.as_ref(), response, events).await?
        } else {
            let bytes = response.bytes().await?;
            let result = backend.parse_response(&bytes)?;
            events.chunk(&result.content).await?;
            result
        };
        if result.model.is_empty() {
            result.model = request.model;
        }

        events.end(&result).await?;
        Ok(result)
    }

    /// Poll the backend's readiness endpoint until it answers with 2xx
    async fn wait_ready(&self, backend: &dyn InferenceBackend) -> Result<()> {
        let url = backend.readiness_url();
        let deadline = tokio::time::Instant::now() + self.settings.readiness_max_wait;
        let probe_timeout = self.settings.readiness_interval.max(Duration::from_secs(2));

        loop {
            match self.client.get(&url).timeout(probe_timeout).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::debug!(backend = backend.name(), status = %response.status(), "backend not ready");
                }
                Err(e) => {
                    tracing::debug!(backend = backend.name(), error = %e, "backend not reachable");
                }
            }

            if tokio::time::Instant::now() + self.settings.readiness_interval > deadline {
                return Err(Error::Backend(format!(
                    "{} not ready after {:?}",
                    backend.name(),
                    self.settings.readiness_max_wait
                )));
            }
            tokio::time::sleep(self.settings.readiness_interval).await;
        }
    }

    /// Publish each streamed unit as it arrives and accumulate the result
    async fn relay_stream(
        backend: &dyn InferenceBackend,
        response: reqwest::Response,
        events: &mut JobEvents,
    ) -> Result<InferenceResult> {
        let mut body = response.bytes_stream();
        let mut buffer = LineBuffer::new();
        let mut acc = Accumulated::default();
        let mut done = false;

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes?;
            for line in buffer.push(&bytes) {
                if Self::relay_line(backend, &line, &mut acc, events).await? {
                    done = true;
                    break 'read;
                }
            }
        }

        if !done {
            if let Some(line) = buffer.finish() {
                done = Self::relay_line(backend, &line, &mut acc, events).await?;
            }
        }
        if !done {
            tracing::warn!(
                job_id = %events.job_id(),
                backend = backend.name(),
                chunks = events.chunks_sent(),
                "stream ended without a completion signal"
            );
            return Err(Error::Backend(format!(
                "{} stream ended without completion",
                backend.name()
            )));
        }

        Ok(InferenceResult {
            content: acc.content,
            finish_reason: acc.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: acc.usage.unwrap_or_default(),
            model: String::new(),
        })
    }

    /// Handle one framed line; returns whether the stream is complete
    async fn relay_line(
        backend: &dyn InferenceBackend,
        line: &str,
        acc: &mut Accumulated,
        events: &mut JobEvents,
    ) -> Result<bool> {
        let data = match backend.framing().frame(line) {
            Frame::Skip => return Ok(false),
            Frame::Done => return Ok(true),
            Frame::Data(data) => data,
        };

        let Some(unit) = backend.parse_unit(data) else {
            tracing::debug!(backend = backend.name(), line = %data, "skipping unparseable stream line");
            return Ok(false);
        };

        if !unit.text.is_empty() {
            events.chunk(&unit.text).await?;
            acc.content.push_str(&unit.text);
        }
        if unit.finish_reason.is_some() {
            acc.finish_reason = unit.finish_reason;
        }
        if unit.usage.is_some() {
            acc.usage = unit.usage;
        }

        Ok(unit.done)
    }
}

/// Whether retrying the job cannot change the outcome
const fn is_permanent(error: &Error) -> bool {
    matches!(
        error,
        Error::Validation(_) | Error::UnsupportedBackend(_) | Error::Protocol(_)
    )
}

/// Job handler for inference jobs
///
/// `llm_inference` names its backend in the payload; the per-backend job
/// types (`VLLM_INFERENCE` and friends) use a handler pinned with
/// [`for_backend`](Self::for_backend).
pub struct InferenceHandler {
    dispatcher: Arc<InferenceDispatcher>,
    publisher: Arc<dyn Publisher>,
    backend: Option<&'static str>,
}

impl std::fmt::Debug for InferenceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceHandler")
            .field("dispatcher", &self.dispatcher)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl InferenceHandler {
    /// Create a handler publishing job events through `publisher`
    #[must_use]
    pub fn new(dispatcher: Arc<InferenceDispatcher>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            dispatcher,
            publisher,
            backend: None,
        }
    }

    /// Create a handler that always runs on `backend`
    #[must_use]
    pub fn for_backend(
        dispatcher: Arc<InferenceDispatcher>,
        publisher: Arc<dyn Publisher>,
        backend: &'static str,
    ) -> Self {
        Self {
            dispatcher,
            publisher,
            backend: Some(backend),
        }
    }
}

#[async_trait]
impl JobHandler for InferenceHandler {
    async fn handle(&self, job: &Job) -> HandlerOutcome {
        let mut events = JobEvents::new(Arc::clone(&self.publisher), &job.id);
        events.start("inference started").await;

        let executed = match self.backend {
            Some(backend) => {
                self.dispatcher
                    .execute_on(backend, &job.payload, &mut events)
                    .await
            }
            None => self.dispatcher.execute(&job.payload, &mut events).await,
        };

        match executed {
            Ok(result) => {
                tracing::info!(
                    job_id = %job.id,
                    chunks = events.chunks_sent(),
                    finish_reason = %result.finish_reason,
                    total_tokens = result.usage.total_tokens,
                    "inference completed"
                );
                HandlerOutcome::Success
            }
            Err(e) => {
                let permanent = is_permanent(&e);
                tracing::warn!(job_id = %job.id, error = %e, permanent, "inference failed");
                events.error(&e.to_string(), !permanent).await;
                if permanent {
                    HandlerOutcome::Permanent(e.to_string())
                } else {
                    HandlerOutcome::Transient(e.to_string())
                }
            }
        }
    }
}
