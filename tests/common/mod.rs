//! Shared test utilities
//!
//! In-memory stand-ins for the broker seams and the config applier.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use citadel_agent::broker::{
    ChannelConnector, MessageStream, Publisher, ReadFrom, StreamBroker, StreamRecord,
};
use citadel_agent::jobs::{HandlerOutcome, Job, JobHandler};
use citadel_agent::manifest::ConfigApplier;
use citadel_agent::subscriber::ConfigUpdate;
use citadel_agent::{Error, Result};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Upper bound on how long an empty read pretends to block
const EMPTY_READ_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    fields: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    next: usize,
    /// id -> (consumer, deliveries, last delivery)
    pending: BTreeMap<String, (String, u64, Instant)>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Vec<Entry>>,
    groups: HashMap<(String, String), GroupState>,
    seq: u64,
    published: Vec<(String, String)>,
    acked: Vec<(String, String)>,
}

/// In-memory broker with consumer-group semantics and failure injection
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    pub fail_reads: AtomicUsize,
    pub fail_acks: AtomicUsize,
    pub fail_ensure: AtomicUsize,
    pub fail_publishes: AtomicUsize,
    pub fail_appends: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a record and return its id
    pub async fn add(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let id = format!("{}-0", state.seq);
        state.streams.entry(stream.to_string()).or_default().push(Entry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
        id
    }

    /// Every record in a stream, oldest first
    pub async fn entries(&self, stream: &str) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|entries| entries.iter().map(|e| e.fields.clone()).collect())
            .unwrap_or_default()
    }

    /// Ids pending in a group
    pub async fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// (stream, id) of every acknowledgment, in order
    pub async fn acked(&self) -> Vec<(String, String)> {
        self.state.lock().await.acked.clone()
    }

    /// Messages published on `channel`, in order
    pub async fn published_on(&self, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Whether the group was created on `stream`
    pub async fn has_group(&self, stream: &str, group: &str) -> bool {
        self.state
            .lock()
            .await
            .groups
            .contains_key(&(stream.to_string(), group.to_string()))
    }

    fn record(stream: &str, entry: &Entry) -> StreamRecord {
        StreamRecord {
            id: entry.id.clone(),
            stream: stream.to_string(),
            fields: entry.fields.clone(),
        }
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        if take_failure(&self.fail_ensure) {
            return Err(Error::Broker("connection refused".to_string()));
        }
        let mut state = self.state.lock().await;
        state.streams.entry(stream.to_string()).or_default();
        state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        block: Duration,
    ) -> Result<Option<StreamRecord>> {
        if take_failure(&self.fail_reads) {
            tokio::time::sleep(EMPTY_READ_PAUSE).await;
            return Err(Error::Broker("connection reset".to_string()));
        }

        {
            let mut state = self.state.lock().await;
            let State {
                streams: all, groups, ..
            } = &mut *state;

            for stream in streams {
                let entries = all.get(stream).cloned().unwrap_or_default();
                let Some(g) = groups.get_mut(&(stream.clone(), group.to_string())) else {
                    return Err(Error::Broker(format!("NOGROUP {stream} {group}")));
                };

                match from {
                    ReadFrom::Pending => {
                        let owned = g
                            .pending
                            .iter_mut()
                            .find(|(_, (owner, _, _))| owner == consumer);
                        if let Some((id, (_, deliveries, delivered_at))) = owned {
                            *deliveries += 1;
                            *delivered_at = Instant::now();
                            if let Some(entry) = entries.iter().find(|e| &e.id == id) {
                                return Ok(Some(Self::record(stream, entry)));
                            }
                        }
                    }
                    ReadFrom::New => {
                        if let Some(entry) = entries.get(g.next) {
                            g.next += 1;
                            g.pending
                                .insert(entry.id.clone(), (consumer.to_string(), 1, Instant::now()));
                            return Ok(Some(Self::record(stream, entry)));
                        }
                    }
                }
            }
        }

        if from == ReadFrom::New {
            tokio::time::sleep(block.min(EMPTY_READ_PAUSE)).await;
        }
        Ok(None)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        if take_failure(&self.fail_acks) {
            return Err(Error::Broker("connection reset".to_string()));
        }
        let mut state = self.state.lock().await;
        if let Some(g) = state
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
        {
            g.pending.remove(id);
        }
        state.acked.push((stream.to_string(), id.to_string()));
        Ok(())
    }

    async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .and_then(|g| g.pending.get(id))
            .map_or(0, |(_, deliveries, _)| *deliveries))
    }

    async fn claim_stale(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<StreamRecord>> {
        let mut state = self.state.lock().await;
        let State {
            streams: all, groups, ..
        } = &mut *state;

        for stream in streams {
            let Some(g) = groups.get_mut(&(stream.clone(), group.to_string())) else {
                return Err(Error::Broker(format!("NOGROUP {stream} {group}")));
            };
            let stale = g
                .pending
                .iter_mut()
                .find(|(_, (_, _, delivered_at))| delivered_at.elapsed() >= min_idle);
            if let Some((id, (owner, deliveries, delivered_at))) = stale {
                *owner = consumer.to_string();
                *deliveries += 1;
                *delivered_at = Instant::now();
                let entry = all
                    .get(stream)
                    .and_then(|entries| entries.iter().find(|e| &e.id == id));
                if let Some(entry) = entry {
                    return Ok(Some(Self::record(stream, entry)));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        if take_failure(&self.fail_publishes) {
            return Err(Error::Broker("publish failed".to_string()));
        }
        self.state
            .lock()
            .await
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<()> {
        if take_failure(&self.fail_appends) {
            return Err(Error::Broker("append failed".to_string()));
        }
        let mut state = self.state.lock().await;
        state.seq += 1;
        let id = format!("{}-0", state.seq);
        let entries = state.streams.entry(stream.to_string()).or_default();
        entries.push(Entry {
            id,
            fields: fields.iter().cloned().collect(),
        });
        if let Some(max) = max_len {
            let excess = entries.len().saturating_sub(max);
            entries.drain(..excess);
        }
        Ok(())
    }
}

/// What one `subscribe` call produces
pub enum Session {
    /// Subscribe fails
    Refuse,
    /// Deliver these items, then close the stream
    Deliver(Vec<Result<String>>),
}

/// Channel connector replaying scripted sessions
///
/// Once the script runs out, subscriptions stay open and silent.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<Session>>,
    pub subscribes: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            subscribes: AtomicUsize::new(0),
        })
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn subscribe(&self, _channel: &str) -> Result<MessageStream> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().await.pop_front() {
            Some(Session::Refuse) => Err(Error::Broker("connection refused".to_string())),
            Some(Session::Deliver(items)) => Ok(futures::stream::iter(items).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Config applier that records every update
#[derive(Default)]
pub struct RecordingApplier {
    pub applied: Mutex<Vec<ConfigUpdate>>,
    pub fail: AtomicUsize,
}

impl RecordingApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn applied(&self) -> Vec<ConfigUpdate> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl ConfigApplier for RecordingApplier {
    async fn apply(&self, update: &ConfigUpdate) -> Result<String> {
        if take_failure(&self.fail) {
            return Err(Error::Manifest("disk full".to_string()));
        }
        self.applied.lock().await.push(update.clone());
        Ok(format!("applied {}", update.device_name))
    }
}

/// Job handler returning scripted outcomes, then `Success`
#[derive(Default)]
pub struct ScriptedHandler {
    outcomes: Mutex<VecDeque<HandlerOutcome>>,
    handled: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    pub fn new(outcomes: Vec<HandlerOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            handled: Mutex::new(Vec::new()),
        })
    }

    /// Job ids handled so far
    pub async fn seen(&self) -> Vec<String> {
        self.handled.lock().await.clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, job: &Job) -> HandlerOutcome {
        self.handled.lock().await.push(job.id.clone());
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(HandlerOutcome::Success)
    }
}

/// Poll `check` until it holds, advancing (possibly paused) time in small steps
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..10_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
