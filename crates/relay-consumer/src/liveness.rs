use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Where the consumer is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Inner {
    state: RwLock<ConsumerState>,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
    events_handled: AtomicU64,
    handler_retries: AtomicU64,
    reconnects: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_failures: AtomicU64,
}

/// Cloneable read-side view of a running consumer, for health checks.
#[derive(Clone, Default)]
pub struct Liveness {
    inner: Arc<Inner>,
}

/// Point-in-time copy of [`Liveness`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessSnapshot {
    pub state: ConsumerState,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub events_handled: u64,
    pub handler_retries: u64,
    pub reconnects: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.read()
    }

    /// When the last event finished handling, `None` before the first one.
    pub fn last_processed_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_processed_at.read()
    }

    pub fn events_handled(&self) -> u64 {
        self.inner.events_handled.load(Ordering::Relaxed)
    }

    pub fn handler_retries(&self) -> u64 {
        self.inner.handler_retries.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.inner.checkpoints_written.load(Ordering::Relaxed)
    }

    pub fn checkpoint_failures(&self) -> u64 {
        self.inner.checkpoint_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        LivenessSnapshot {
            state: self.state(),
            last_processed_at: self.last_processed_time(),
            events_handled: self.events_handled(),
            handler_retries: self.handler_retries(),
            reconnects: self.reconnects(),
            checkpoints_written: self.checkpoints_written(),
            checkpoint_failures: self.checkpoint_failures(),
        }
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        *self.inner.state.write() = state;
    }

    pub(crate) fn record_handled(&self, at: DateTime<Utc>) {
        *self.inner.last_processed_at.write() = Some(at);
        self.inner.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_retries(&self, retries: u32) {
        self.inner
            .handler_retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.inner.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failure(&self) {
        self.inner.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}
