//! Citadel agent - node-resident worker for GPU compute nodes
//!
//! This library provides the core functionality for the Citadel agent:
//! - Job consumption from broker streams with at-least-once delivery
//! - Local LLM inference against vLLM, Ollama and llama.cpp
//! - Realtime device configuration updates
//! - Periodic status telemetry
//! - Device authorization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Control plane                      │
//! │   Job streams  │  Config channel  │  Status stream   │
//! └────────────────────┬────────────────────────────────┘
//!                      │  Redis or API proxy
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Citadel agent                       │
//! │  StreamConsumer │ ConfigSubscriber │ Telemetry      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Inference backends                      │
//! │   vLLM  │  Ollama  │  llama.cpp                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod daemon;
pub mod device_code;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod manifest;
pub mod node_id;
pub mod status_server;
pub mod subscriber;
pub mod telemetry;
pub mod worker;

pub use auth::{DeviceAuthError, DeviceAuthFlow, DeviceAuthSession, DeviceToken, FlowState};
pub use backoff::{Backoff, BackoffPolicy};
pub use broker::{
    ApiClient, ChannelConnector, JobEvents, Publisher, RedisBroker, StreamBroker, StreamRecord,
};
pub use config::{Config, Transport};
pub use daemon::Daemon;
pub use device_code::DeviceCode;
pub use error::{Error, Result};
pub use inference::{InferenceDispatcher, InferenceHandler, InferenceRequest, InferenceResult};
pub use jobs::{HandlerOutcome, HandlerRegistry, Job, JobHandler, JobKind};
pub use manifest::{ConfigApplier, Manifest, ManifestApplier};
pub use node_id::NodeId;
pub use status_server::StatusServer;
pub use subscriber::{ConfigSubscriber, ConfigUpdate};
pub use telemetry::{StatusSnapshot, TelemetryPublisher, TelemetrySettings};
pub use worker::{ConsumerSettings, Disposition, StreamConsumer};
