//! Bounded registry of live status streams.
//!
//! Each connection is a task that owns two timers: a keepalive that emits
//! `ping` frames and a poll timer that asks its [`StatusSource`] for the
//! current status. A terminal status closes the stream with `status` then
//! `end`; a dropped receiver or a cancelled token closes it silently. Either
//! way the connection deregisters itself.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::FactoryError;
use crate::streaming::frame::SseFrame;

/// Statuses after which a stream closes.
pub const TERMINAL_STATES: &[&str] = &["COMPLETED", "FAILED", "CANCELLED"];

pub fn is_terminal_state(status: &str) -> bool {
    TERMINAL_STATES.contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Run,
    Build,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Build => "build",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub id: String,
}

impl StreamKey {
    pub fn run(id: &str) -> Self {
        Self {
            kind: StreamKind::Run,
            id: id.to_string(),
        }
    }

    pub fn build(id: i64) -> Self {
        Self {
            kind: StreamKind::Build,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Where a connection reads the current status of the thing it watches.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn current_status(&self) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub keepalive: Duration,
    pub poll_interval: Duration,
    pub max_streams: usize,
    pub max_connections_per_stream: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            poll_interval: Duration::from_millis(1000),
            max_streams: 256,
            max_connections_per_stream: 16,
        }
    }
}

/// Receiving half of one connection.
pub struct StreamSubscription {
    pub connection_id: u64,
    pub frames: mpsc::Receiver<SseFrame>,
}

type ConnectionSets = DashMap<StreamKey, HashSet<u64>>;

/// Removes its connection from the registry when the task ends, however it
/// ends.
struct Registration {
    connections: Arc<ConnectionSets>,
    key: StreamKey,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(mut set) = self.connections.get_mut(&self.key) {
            set.remove(&self.id);
        }
        self.connections.remove_if(&self.key, |_, set| set.is_empty());
        debug!(stream = %self.key, connection = self.id, "Stream connection closed");
    }
}

#[derive(Clone)]
pub struct StreamManager {
    limits: StreamLimits,
    connections: Arc<ConnectionSets>,
    /// Serializes admission so the stream count check and insert are one step.
    admission: Arc<Mutex<()>>,
    next_id: Arc<AtomicU64>,
}

impl StreamManager {
    pub fn new(limits: StreamLimits) -> Self {
        Self {
            limits,
            connections: Arc::new(DashMap::new()),
            admission: Arc::new(Mutex::new(())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of distinct keys with at least one open connection.
    pub fn open_streams(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_count(&self, key: &StreamKey) -> usize {
        self.connections.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Open a connection on `key` and start its task.
    pub fn subscribe(
        &self,
        key: StreamKey,
        source: Arc<dyn StatusSource>,
        cancel: CancellationToken,
    ) -> Result<StreamSubscription, FactoryError> {
        let registration = self.register(&key)?;
        let connection_id = registration.id;
        let (tx, rx) = mpsc::channel(32);
        info!(stream = %key, connection = connection_id, "Stream connection opened");

        let limits = self.limits;
        tokio::spawn(async move {
            run_connection(&key, source, tx, cancel, limits).await;
            drop(registration);
        });

        Ok(StreamSubscription {
            connection_id,
            frames: rx,
        })
    }

    fn register(&self, key: &StreamKey) -> Result<Registration, FactoryError> {
        let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        // `len()` locks every shard, so it must run before `entry()` takes one.
        if !self.connections.contains_key(key)
            && self.connections.len() >= self.limits.max_streams
        {
            return Err(FactoryError::StreamLimit(format!(
                "{} streams already open",
                self.limits.max_streams
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut set = self.connections.entry(key.clone()).or_default();
        if set.len() >= self.limits.max_connections_per_stream {
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.connections.remove_if(key, |_, s| s.is_empty());
            }
            return Err(FactoryError::StreamLimit(format!(
                "{} already has {} connections",
                key, self.limits.max_connections_per_stream
            )));
        }
        set.insert(id);

        Ok(Registration {
            connections: self.connections.clone(),
            key: key.clone(),
            id,
        })
    }
}

async fn run_connection(
    key: &StreamKey,
    source: Arc<dyn StatusSource>,
    tx: mpsc::Sender<SseFrame>,
    cancel: CancellationToken,
    limits: StreamLimits,
) {
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + limits.keepalive, limits.keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(limits.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_status: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = keepalive.tick() => {
                if tx.send(SseFrame::ping()).await.is_err() {
                    break;
                }
            }
            _ = poll.tick() => {
                match source.current_status().await {
                    Ok(status) => {
                        if last_status.as_deref() != Some(status.as_str())
                            && tx.send(SseFrame::status(&key.id, &status)).await.is_err()
                        {
                            break;
                        }
                        if is_terminal_state(&status) {
                            let _ = tx.send(SseFrame::end(&key.id, &status)).await;
                            break;
                        }
                        last_status = Some(status);
                    }
                    Err(e) => {
                        if tx.send(SseFrame::error(&e.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
