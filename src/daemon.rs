//! Daemon - the node agent service
//!
//! Wires the job consumers, the config subscriber, the telemetry publisher
//! and the local status server to the configured broker transport, runs them
//! as independent tasks and stops them together.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{ApiClient, ChannelConnector, Publisher, RedisBroker, StreamBroker};
use crate::config::Transport;
use crate::device_code::DeviceCode;
use crate::inference::{BackendRegistry, InferenceDispatcher, InferenceHandler, OllamaPullHandler};
use crate::jobs::{ConfigJobHandler, HandlerRegistry, JobKind};
use crate::manifest::{ConfigApplier, ManifestApplier};
use crate::status_server::StatusServer;
use crate::subscriber::ConfigSubscriber;
use crate::telemetry::{
    BasicCollector, LoggingKeepAlive, StatusCollector, TelemetryPublisher, TelemetrySettings,
};
use crate::worker::{ConsumerSettings, StreamConsumer};
use crate::{Config, Error, Result};

/// Broker endpoints, one per component
///
/// No two components share a connection.
struct Endpoints {
    jobs: Arc<dyn StreamBroker>,
    job_events: Arc<dyn Publisher>,
    config_jobs: Arc<dyn StreamBroker>,
    config_events: Arc<dyn Publisher>,
    telemetry: Arc<dyn Publisher>,
    channels: Option<Arc<dyn ChannelConnector>>,
    telemetry_settings: TelemetrySettings,
}

impl Endpoints {
    fn connect(config: &Config, transport: &Transport) -> Result<Self> {
        match transport {
            Transport::Redis { url, password } => {
                let open = || RedisBroker::open(url, password.as_ref()).map(Arc::new);
                let jobs = open()?;
                tracing::info!(url = %jobs.display_url(), "using direct broker transport");

                Ok(Self {
                    jobs,
                    job_events: open()?,
                    config_jobs: open()?,
                    config_events: open()?,
                    telemetry: open()?,
                    channels: Some(open()?),
                    telemetry_settings: TelemetrySettings::direct(&config.node_id),
                })
            }
            Transport::Api {
                base_url,
                token,
                org_id,
            } => {
                let open = || ApiClient::new(base_url, token.clone()).map(Arc::new);
                tracing::info!(%base_url, %org_id, "using api proxy transport");
                tracing::info!("api proxy has no subscriptions, realtime config updates disabled");

                Ok(Self {
                    jobs: open()?,
                    job_events: open()?,
                    config_jobs: open()?,
                    config_events: open()?,
                    telemetry: open()?,
                    channels: None,
                    telemetry_settings: TelemetrySettings::api(org_id, &config.node_id)?,
                })
            }
        }
    }
}

/// The Citadel daemon - runs every node-side component
pub struct Daemon {
    config: Config,
    device_code: DeviceCode,
    collector: Arc<dyn StatusCollector>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a daemon
    #[must_use]
    pub fn new(config: Config, device_code: DeviceCode) -> Self {
        Self {
            config,
            device_code,
            collector: Arc::new(BasicCollector::new()),
        }
    }

    /// Replace the status collector
    #[must_use]
    pub fn with_collector(mut self, collector: Arc<dyn StatusCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if startup fails or a component stops unexpectedly
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
        });

        self.run_until(cancel).await
    }

    /// Run until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if no transport is configured, a component fails to
    /// start, or a component stops for any reason other than cancellation
    pub async fn run_until(self, cancel: CancellationToken) -> Result<()> {
        let transport = self.config.transport.clone().ok_or_else(|| {
            Error::Config(
                "no broker transport configured; run `citadel login` or set CITADEL_REDIS_URL"
                    .to_string(),
            )
        })?;
        let endpoints = Endpoints::connect(&self.config, &transport)?;
        let applier: Arc<dyn ConfigApplier> =
            Arc::new(ManifestApplier::new(&self.config.manifest_dir));

        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        // Inference jobs
        let inference = &self.config.inference;
        let dispatcher = Arc::new(InferenceDispatcher::new(
            BackendRegistry::standard(
                &inference.vllm_url,
                &inference.ollama_url,
                &inference.llamacpp_url,
            ),
            inference.dispatcher_settings(),
        )?);
        let mut handlers = HandlerRegistry::new().with(
            JobKind::LlmInference,
            Arc::new(InferenceHandler::new(
                Arc::clone(&dispatcher),
                Arc::clone(&endpoints.job_events),
            )),
        );
        for kind in JobKind::ALL {
            if let Some(backend) = kind.pinned_backend() {
                handlers.register(
                    kind,
                    Arc::new(InferenceHandler::for_backend(
                        Arc::clone(&dispatcher),
                        Arc::clone(&endpoints.job_events),
                        backend,
                    )),
                );
            }
        }
        handlers.register(
            JobKind::OllamaPull,
            Arc::new(OllamaPullHandler::new(
                &inference.ollama_url,
                Arc::clone(&endpoints.job_events),
            )?),
        );
        let worker = &self.config.worker;
        let mut settings = ConsumerSettings::new(
            worker.queues.clone(),
            worker.group.clone(),
            worker.consumer.clone(),
        );
        settings.block = worker.block;
        settings.max_attempts = worker.max_attempts;
        settings.claim_idle = worker.claim_idle;
        let consumer = StreamConsumer::new(endpoints.jobs, handlers, settings)
            .with_dead_letters(endpoints.job_events);
        let token = cancel.clone();
        tasks.spawn(async move { ("job consumer", consumer.run(token).await) });

        // Device config jobs
        let handlers = HandlerRegistry::new().with(
            JobKind::ApplyDeviceConfig,
            Arc::new(ConfigJobHandler::new(Arc::clone(&applier))),
        );
        let mut settings = ConsumerSettings::new(
            vec![worker.config_queue.clone()],
            worker.config_group.clone(),
            worker.consumer.clone(),
        );
        settings.block = worker.block;
        settings.max_attempts = worker.max_attempts;
        settings.claim_idle = worker.claim_idle;
        let consumer = StreamConsumer::new(endpoints.config_jobs, handlers, settings)
            .with_dead_letters(endpoints.config_events);
        let token = cancel.clone();
        tasks.spawn(async move { ("config consumer", consumer.run(token).await) });

        // Realtime config updates
        if let Some(connector) = endpoints.channels {
            let subscriber =
                ConfigSubscriber::new(connector, Arc::clone(&applier), self.config.node_id.clone());
            let token = cancel.clone();
            tasks.spawn(async move { ("config subscriber", subscriber.run(token).await) });
        }

        // Telemetry
        let mut telemetry_settings = endpoints.telemetry_settings;
        telemetry_settings.interval = self.config.telemetry.interval;
        telemetry_settings.keep_alive_every = self.config.telemetry.keep_alive_every;
        let telemetry = TelemetryPublisher::new(
            endpoints.telemetry,
            Arc::clone(&self.collector),
            self.config.node_id.clone(),
            self.device_code.clone(),
            telemetry_settings,
        )
        .with_keep_alive(Arc::new(LoggingKeepAlive));
        let token = cancel.clone();
        tasks.spawn(async move { ("telemetry", telemetry.run(token).await) });

        // Local status endpoints
        let server = StatusServer::new(
            Arc::clone(&self.collector),
            self.config.node_id.clone(),
            self.device_code.clone(),
            self.config.status_port,
        );
        let token = cancel.clone();
        tasks.spawn(async move { ("status server", server.run(token).await) });

        tracing::info!(
            node_id = %self.config.node_id,
            transport = transport.label(),
            tasks = tasks.len(),
            "citadel agent running"
        );

        supervise(tasks, &cancel).await
    }
}

/// Wait for every task; the first unexpected stop cancels the rest
async fn supervise(
    mut tasks: JoinSet<(&'static str, Result<()>)>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut failure = None;

    while let Some(joined) = tasks.join_next().await {
        let (name, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "component task panicked");
                failure.get_or_insert_with(|| Error::Config(format!("component panicked: {e}")));
                cancel.cancel();
                continue;
            }
        };

        match result {
            Err(e) if e.is_cancelled() => tracing::debug!(component = name, "stopped"),
            Ok(()) if cancel.is_cancelled() => tracing::debug!(component = name, "stopped"),
            Ok(()) => {
                tracing::error!(component = name, "component exited unexpectedly");
                failure.get_or_insert_with(|| Error::Config(format!("{name} exited unexpectedly")));
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!(component = name, error = %e, "component failed");
                failure.get_or_insert(e);
                cancel.cancel();
            }
        }
    }

    failure.map_or(Ok(()), Err)
}
