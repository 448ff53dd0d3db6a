//! Model pulls into the Ollama backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broker::{JobEvents, Publisher};
use crate::jobs::{HandlerOutcome, Job, JobHandler};
use crate::{Error, Result};

/// Upper bound on one pull, download included
pub const PULL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Deserialize)]
struct PullReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// Result published in the pull job's end event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullResult {
    pub model: String,
    pub status: String,
}

/// Job handler for `OLLAMA_PULL`
pub struct OllamaPullHandler {
    client: reqwest::Client,
    base_url: String,
    publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for OllamaPullHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaPullHandler")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OllamaPullHandler {
    /// Create a handler for the Ollama server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, publisher: Arc<dyn Publisher>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("citadel/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(PULL_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            publisher,
        })
    }

    /// Pull `model`, returning Ollama's final status
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if Ollama rejects the request (4xx)
    /// - `Error::Backend` on any other non-2xx status, an `error` in the
    ///   reply, or a final status other than `success`
    /// - `Error::Http` if Ollama is unreachable
    pub async fn pull(&self, model: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&json!({ "model": model, "stream": false }))
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        let reply = serde_json::from_slice::<PullReply>(&body).ok();

        if !status.is_success() {
            let message = reply
                .and_then(|r| r.error)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(if status.is_client_error() {
                Error::Validation(format!("ollama rejected pull of {model}: {message}"))
            } else {
                Error::Backend(format!("ollama returned {status}: {message}"))
            });
        }

        let reply = reply.ok_or_else(|| {
            Error::Backend(format!(
                "unreadable pull reply: {}",
                String::from_utf8_lossy(&body)
            ))
        })?;
        if let Some(error) = reply.error {
            return Err(Error::Backend(format!("pull of {model} failed: {error}")));
        }
        if reply.status != "success" {
            return Err(Error::Backend(format!(
                "pull of {model} ended with status {:?}",
                reply.status
            )));
        }

        Ok(reply.status)
    }
}

#[async_trait]
impl JobHandler for OllamaPullHandler {
    async fn handle(&self, job: &Job) -> HandlerOutcome {
        let events = JobEvents::new(Arc::clone(&self.publisher), &job.id);

        let Some(model) = job.payload_str("model").filter(|m| !m.trim().is_empty()) else {
            let reason = "job payload missing 'model' field";
            events.error(reason, false).await;
            return HandlerOutcome::Permanent(reason.to_string());
        };

        events.start(&format!("pulling {model}")).await;
        tracing::info!(job_id = %job.id, %model, "pulling ollama model");

        match self.pull(model).await {
            Ok(status) => {
                let result = PullResult {
                    model: model.to_string(),
                    status,
                };
                if let Err(e) = events.end(&result).await {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to publish end event");
                }
                tracing::info!(job_id = %job.id, %model, "model pulled");
                HandlerOutcome::Success
            }
            Err(e) => {
                let permanent = matches!(e, Error::Validation(_));
                tracing::warn!(job_id = %job.id, %model, error = %e, permanent, "model pull failed");
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
