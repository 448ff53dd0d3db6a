//! Consumer-group stream worker
//!
//! Claims one record at a time from one or more job queues, dispatches it to
//! the registered handler and acknowledges only after the handler is done
//! with it. Transport failures are retried with exponential backoff; the
//! loop runs until cancelled.
//!
//! Records this consumer failed to finish stay in its pending list and are
//! re-read before any new work. The consumer name is stable across restarts
//! so a restarted agent picks up its own pending records; records left
//! behind by a consumer that never came back are claimed once they have sat
//! idle for `claim_idle`. Once a record has been delivered more than
//! `max_attempts` times it is copied to a dead-letter stream and
//! acknowledged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::broker::{Publisher, ReadFrom, StreamBroker, StreamRecord};
use crate::jobs::{HandlerOutcome, HandlerRegistry, decode_record};
use crate::{Error, Result};

/// Default job queue
pub const DEFAULT_QUEUE: &str = "jobs:v1:gpu-general";

/// Default consumer group for job queues
pub const DEFAULT_GROUP: &str = "citadel-workers";

/// Queue carrying device configuration jobs
pub const CONFIG_QUEUE: &str = "jobs:v1:config";

/// Consumer group for the configuration queue
pub const CONFIG_GROUP: &str = "citadel-config-consumers";

/// Reason recorded on dead-lettered records
const MAX_ATTEMPTS_REASON: &str = "exceeded max retry attempts";

/// Consumer identity and polling parameters
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Streams to read from
    pub queues: Vec<String>,
    /// Consumer group name
    pub group: String,
    /// This consumer's identity within the group
    pub consumer: String,
    /// Server-side block per read
    pub block: Duration,
    /// Deliveries allowed before a record is dead-lettered; 0 disables
    pub max_attempts: u64,
    /// Backoff for transport failures and transient handler failures
    pub backoff: BackoffPolicy,
    /// Claim other consumers' records pending at least this long; `None`
    /// disables claiming
    pub claim_idle: Option<Duration>,
    /// Minimum time between claim attempts that found nothing
    pub claim_interval: Duration,
}

/// Default idle time before another consumer's pending record is claimed
///
/// Longer than the inference request timeout, so a live consumer's record
/// is never taken from under it.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(15 * 60);

impl ConsumerSettings {
    /// Settings for `consumer` reading `queues` as part of `group`
    #[must_use]
    pub fn new(queues: Vec<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            queues,
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::from_millis(5000),
            max_attempts: 3,
            backoff: BackoffPolicy::CONSUMER,
            claim_idle: Some(DEFAULT_CLAIM_IDLE),
            claim_interval: Duration::from_secs(60),
        }
    }
}

/// Consumer identity for a node, like `citadel-gpu-1`
///
/// Stable across restarts of the same node.
#[must_use]
pub fn worker_id(node_id: &str) -> String {
    format!("citadel-{node_id}")
}

/// Dead-letter stream for a queue
///
/// `jobs:v1:<rest>` maps to `dlq:v1:<rest>`, keeping tag segments; anything
/// else maps to `dlq:v1:<last segment>`.
#[must_use]
pub fn dead_letter_queue(queue: &str) -> String {
    queue.strip_prefix("jobs:v1:").map_or_else(
        || {
            let suffix = queue.rsplit(':').next().unwrap_or(queue);
            format!("dlq:v1:{suffix}")
        },
        |rest| format!("dlq:v1:{rest}"),
    )
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The handler ran
    Handled {
        /// Job ID
        job_id: String,
        /// Handler result; the record was acknowledged unless transient
        outcome: HandlerOutcome,
    },
    /// Undecodable, of unknown type, or without a handler; acknowledged
    Dropped {
        /// Why the record was dropped
        reason: String,
    },
    /// Delivered too often; copied to the dead-letter stream and acknowledged
    DeadLettered {
        /// Deliveries seen by the broker
        attempts: u64,
    },
}

impl Disposition {
    /// Whether the record was acknowledged
    #[must_use]
    pub const fn acknowledged(&self) -> bool {
        match self {
            Self::Handled { outcome, .. } => outcome.should_ack(),
            Self::Dropped { .. } | Self::DeadLettered { .. } => true,
        }
    }
}

/// Consumer-group worker for job streams
pub struct StreamConsumer {
    broker: Arc<dyn StreamBroker>,
    dead_letters: Option<Arc<dyn Publisher>>,
    handlers: HandlerRegistry,
    settings: ConsumerSettings,
    check_pending: AtomicBool,
    last_claim: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("settings", &self.settings)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl StreamConsumer {
    /// Create a consumer
    #[must_use]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        handlers: HandlerRegistry,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            dead_letters: None,
            handlers,
            settings,
            check_pending: AtomicBool::new(true),
            last_claim: Mutex::new(None),
        }
    }

    /// Publish over-delivered records to dead-letter streams through `publisher`
    #[must_use]
    pub fn with_dead_letters(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    /// Consumer settings
    #[must_use]
    pub const fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Run until cancelled
    ///
    /// # Errors
    ///
    /// Always returns an error: `Error::Cancelled` on shutdown. Transport
    /// failures are retried, never returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.settings.backoff.start();
        let mut retry = self.settings.backoff.start();

        self.ensure_groups(&cancel, &mut backoff).await?;
        tracing::info!(
            queues = ?self.settings.queues,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "stream consumer started"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                read = self.read_next() => read,
            };

            let record = match read {
                Ok(Some(record)) => {
                    backoff.reset();
                    record
                }
                Ok(None) => {
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "stream read failed");
                    sleep_or_cancel(&cancel, delay).await?;
                    continue;
                }
            };

            match self.process(record).await {
                Ok(Disposition::Handled {
                    job_id,
                    outcome: HandlerOutcome::Transient(reason),
                }) => {
                    let delay = retry.next_delay();
                    tracing::warn!(%job_id, %reason, retry_in = ?delay, "job left for redelivery");
                    sleep_or_cancel(&cancel, delay).await?;
                }
                Ok(_) => retry.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "failed to settle record");
                    sleep_or_cancel(&cancel, delay).await?;
                }
            }
        }
    }

    async fn ensure_groups(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> Result<()> {
        for queue in &self.settings.queues {
            loop {
                match self.broker.ensure_group(queue, &self.settings.group).await {
                    Ok(()) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(%queue, error = %e, retry_in = ?delay, "failed to ensure consumer group");
                        sleep_or_cancel(cancel, delay).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Claim the next record
    ///
    /// Order: this consumer's own pending records, then stale records
    /// abandoned by other consumers, then new records.
    ///
    /// # Errors
    ///
    /// Returns the broker's error on transport failure
    pub async fn read_next(&self) -> Result<Option<StreamRecord>> {
        let s = &self.settings;

        if self.check_pending.load(Ordering::Acquire) {
            let pending = self
                .broker
                .read_group(&s.queues, &s.group, &s.consumer, ReadFrom::Pending, s.block)
                .await?;
            if pending.is_some() {
                return Ok(pending);
            }
            self.check_pending.store(false, Ordering::Release);
        }

        if let Some(record) = self.claim_stale().await? {
            return Ok(Some(record));
        }

        self.broker
            .read_group(&s.queues, &s.group, &s.consumer, ReadFrom::New, s.block)
            .await
    }

    /// Take over one record another consumer left pending past `claim_idle`
    async fn claim_stale(&self) -> Result<Option<StreamRecord>> {
        let s = &self.settings;
        let Some(min_idle) = s.claim_idle else {
            return Ok(None);
        };

        let mut last = self.last_claim.lock().await;
        let now = Instant::now();
        let previous = *last;
        if previous.is_some_and(|at| now.duration_since(at) < s.claim_interval) {
            return Ok(None);
        }
        *last = Some(now);

        let claimed = self
            .broker
            .claim_stale(&s.queues, &s.group, &s.consumer, min_idle)
            .await?;
        if let Some(record) = &claimed {
            // there may be more; look again on the next read
            *last = None;
            tracing::info!(
                record_id = %record.id,
                queue = %record.stream,
                consumer = %s.consumer,
                "claimed stale record"
            );
        }
        Ok(claimed)
    }

    /// Dispatch one record and settle it with the broker
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgment fails; the record stays pending
    pub async fn process(&self, record: StreamRecord) -> Result<Disposition> {
        let disposition = self.dispatch(&record).await;

        if disposition.acknowledged() {
            if let Err(e) = self.ack(&record).await {
                self.check_pending.store(true, Ordering::Release);
                return Err(e);
            }
        } else {
            self.check_pending.store(true, Ordering::Release);
        }

        Ok(disposition)
    }

    async fn dispatch(&self, record: &StreamRecord) -> Disposition {
        let s = &self.settings;

        if s.max_attempts > 0 {
            let attempts = match self
                .broker
                .delivery_count(&record.stream, &s.group, &record.id)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(record_id = %record.id, error = %e, "failed to read delivery count");
                    0
                }
            };

            if attempts > s.max_attempts {
                tracing::warn!(
                    record_id = %record.id,
                    queue = %record.stream,
                    attempts,
                    max_attempts = s.max_attempts,
                    "moving record to dead-letter queue"
                );
                self.dead_letter(record, MAX_ATTEMPTS_REASON).await;
                return Disposition::DeadLettered { attempts };
            }
        }

        let job = match decode_record(record) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(record_id = %record.id, error = %e, "dropping undecodable record");
                return Disposition::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        let Some(handler) = self.handlers.get(job.kind) else {
            tracing::warn!(job_id = %job.id, kind = %job.kind, "no handler registered, dropping job");
            return Disposition::Dropped {
                reason: format!("no handler for {}", job.kind),
            };
        };

        tracing::info!(job_id = %job.id, kind = %job.kind, queue = %record.stream, "processing job");
        let outcome = handler.handle(&job).await;

        match &outcome {
            HandlerOutcome::Success => tracing::info!(job_id = %job.id, "job completed"),
            HandlerOutcome::Permanent(reason) => {
                tracing::warn!(job_id = %job.id, %reason, "job failed permanently, dropping");
            }
            HandlerOutcome::Transient(_) => {}
        }

        Disposition::Handled {
            job_id: job.id,
            outcome,
        }
    }

    async fn ack(&self, record: &StreamRecord) -> Result<()> {
        self.broker
            .ack(&record.stream, &self.settings.group, &record.id)
            .await
    }

    async fn dead_letter(&self, record: &StreamRecord, reason: &str) {
        let Some(publisher) = &self.dead_letters else {
            tracing::warn!(record_id = %record.id, "no dead-letter publisher configured, discarding");
            return;
        };

        let dlq = dead_letter_queue(&record.stream);
        let fields = vec![
            ("original_message_id".to_string(), record.id.clone()),
            ("original_queue".to_string(), record.stream.clone()),
            ("reason".to_string(), reason.to_string()),
            (
                "moved_at".to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("worker_id".to_string(), self.settings.consumer.clone()),
            (
                "jobId".to_string(),
                record.field("jobId").unwrap_or_default().to_string(),
            ),
            (
                "payload".to_string(),
                record.field("payload").unwrap_or_default().to_string(),
            ),
        ];

        if let Err(e) = publisher.append(&dlq, &fields, None).await {
            tracing::error!(record_id = %record.id, %dlq, error = %e, "failed to write dead letter");
        }
    }
}

/// Sleep for `delay` unless cancelled first
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
