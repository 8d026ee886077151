//! # Consumer
//!
//! Wires a byte stream through line splitting, the event parser, the handler
//! retry loop and the checkpoint manager, and rebuilds the stream when it
//! drops.
//!
//! ```text
//! connector ──► ChunkReader ──► LineBuffer ──► EventParser ──► handler (retry) ──► checkpoint
//!     ▲                                                                              │
//!     └──────────── reconnect with resume id from the store ◄────────────────────────┘
//! ```
//!
//! Events are handled strictly one at a time in arrival order. An event is
//! counted towards the next checkpoint only after its handler acknowledged it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::parser::DEFAULT_TICKER_TYPE;
use relay_core::{ConsumerError, Event, EventParser, Retryable, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointOptions};
use crate::executor::{retry, sleep_or_cancel, Backoff, RetryError};
use crate::handler::EventHandler;
use crate::lines::LineBuffer;
use crate::liveness::{ConsumerState, Liveness};
use crate::source::{ByteStream, ChunkReader, StreamConnector};

/// Default number of raw chunks read ahead of the handler.
pub const DEFAULT_READ_AHEAD_CHUNKS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConfig {
    /// Retries for one event before the consumer gives up.
    pub handler_retry: RetryPolicy,
    /// Retries for rebuilding a lost connection.
    pub reconnect_retry: RetryPolicy,
    pub read_ahead_chunks: usize,
    /// Event type whose data is discarded.
    pub ticker_type: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_retry: RetryPolicy::default(),
            reconnect_retry: RetryPolicy::reconnect(),
            read_ahead_chunks: DEFAULT_READ_AHEAD_CHUNKS,
            ticker_type: DEFAULT_TICKER_TYPE.to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConsumerError> {
        self.handler_retry.validate()?;
        self.reconnect_retry.validate()?;
        if self.read_ahead_chunks == 0 {
            return Err(ConsumerError::Config(
                "read-ahead must be at least one chunk".into(),
            ));
        }
        Ok(())
    }
}

pub struct Consumer {
    config: ConsumerConfig,
    connector: Option<Arc<dyn StreamConnector>>,
    handler: Option<Arc<dyn EventHandler>>,
    checkpoints: CheckpointManager,
    liveness: Liveness,
    cancel: CancellationToken,
    /// Established by `consume`, taken by `run`.
    stream: Option<ByteStream>,
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}

impl Consumer {
    pub fn new() -> Self {
        let liveness = Liveness::new();
        Self {
            config: ConsumerConfig::default(),
            connector: None,
            handler: None,
            checkpoints: CheckpointManager::new(liveness.clone()),
            liveness,
            cancel: CancellationToken::new(),
            stream: None,
        }
    }

    pub fn with_config(config: ConsumerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Enable checkpointing. Must come before [`Consumer::consume`] for the
    /// first connection to resume from the stored id.
    pub fn checkpoint(&mut self, options: CheckpointOptions) -> Result<&mut Self, ConsumerError> {
        self.checkpoints.configure(options)?;
        Ok(self)
    }

    /// Open the stream through `connector`, resuming from the stored
    /// checkpoint if there is one.
    ///
    /// Any failure here is a construction failure and is not retried.
    pub async fn consume<C>(&mut self, connector: C) -> Result<&mut Self, ConsumerError>
    where
        C: StreamConnector + 'static,
    {
        if self.connector.is_some() {
            return Err(ConsumerError::InvalidState(
                "a stream is already being consumed".into(),
            ));
        }
        self.liveness.set_state(ConsumerState::Connecting);

        let resume_id = match self.checkpoints.resume_id().await {
            Ok(id) => id,
            Err(e) => {
                self.liveness.set_state(ConsumerState::Idle);
                return Err(e);
            }
        };
        info!(resume_id = ?resume_id, "opening event stream");

        let established = match connector.connect(resume_id.as_deref()) {
            Ok(connection) => connection.establish().await,
            Err(e) => Err(e),
        };
        let stream = match established {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "could not establish event stream");
                self.liveness.set_state(ConsumerState::Idle);
                return Err(ConsumerError::Construction(e));
            }
        };

        // Stays `Connecting` until `run` starts reading
        self.connector = Some(Arc::new(connector));
        self.stream = Some(stream);
        Ok(self)
    }

    /// Register the event handler. The latest registration replaces any
    /// earlier one. Without a handler, events are acknowledged as they
    /// arrive.
    pub fn on_event<H>(&mut self, handler: H) -> Result<&mut Self, ConsumerError>
    where
        H: EventHandler + 'static,
    {
        if self.connector.is_none() {
            return Err(ConsumerError::InvalidState(
                "a stream must be consumed first".into(),
            ));
        }
        if self.handler.is_some() {
            debug!("replacing event handler");
        }
        self.handler = Some(Arc::new(handler));
        Ok(self)
    }

    /// When the last event finished handling, `None` before the first one.
    pub fn last_processed_time(&self) -> Option<DateTime<Utc>> {
        self.liveness.last_processed_time()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.liveness.state()
    }

    /// Token that stops [`Consumer::run`] when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("consumer shutdown requested");
        self.cancel.cancel();
    }

    /// Drive the stream until it ends, the handler gives up, reconnecting
    /// gives up, or the consumer is cancelled.
    ///
    /// A stream that ends without error finishes with `Ok(())`.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| ConsumerError::InvalidState("a stream must be consumed first".into()))?;
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| ConsumerError::InvalidState("the stream has already been run".into()))?;

        let mut reconnect = Backoff::new(self.config.reconnect_retry.clone());

        let result = loop {
            self.liveness.set_state(ConsumerState::Streaming);
            let handled_before = self.liveness.events_handled();

            match self.pump(stream).await {
                Ok(()) => {
                    info!("event stream ended");
                    break Ok(());
                }
                Err(ConsumerError::ConnectionLost(e)) if e.is_retryable() => {
                    // A connection that delivered events earns a fresh budget
                    if self.liveness.events_handled() > handled_before {
                        reconnect.reset();
                    }
                    warn!(error = %e, "event stream lost");
                    self.liveness.set_state(ConsumerState::Reconnecting);
                    match self
                        .reconnect(connector.as_ref(), &mut reconnect, ConsumerError::ConnectionLost(e))
                        .await
                    {
                        Ok(next) => stream = next,
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.liveness.set_state(ConsumerState::Closed);
        if let Err(e) = &result {
            error!(kind = e.error_kind(), error = %e, "consumer stopped");
        }
        result
    }

    /// Read one connection to its end. `Ok` means the stream ended normally.
    async fn pump(&mut self, stream: ByteStream) -> Result<(), ConsumerError> {
        let mut reader = ChunkReader::spawn(stream, self.config.read_ahead_chunks);
        let mut lines = LineBuffer::new();
        let mut parser = EventParser::with_ticker_type(self.config.ticker_type.clone());

        loop {
            let chunk = tokio::select! {
                chunk = reader.next() => chunk,
                () = self.cancel.cancelled() => return Err(ConsumerError::Cancelled),
            };

            match chunk {
                Some(Ok(bytes)) => {
                    lines.push(&bytes);
                    while let Some(line) = lines.next_line() {
                        if let Some(event) = parser.feed(&line) {
                            self.dispatch(event).await?;
                        }
                    }
                }
                Some(Err(e)) => return Err(ConsumerError::ConnectionLost(e)),
                None => {
                    if let Some(line) = lines.finish() {
                        if let Some(event) = parser.feed(&line) {
                            self.dispatch(event).await?;
                        }
                    }
                    if parser.has_pending_data() {
                        debug!("discarding unterminated event at end of stream");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<(), ConsumerError> {
        debug!(id = %event.id, event_type = %event.event_type, "event received");

        if let Some(handler) = self.handler.clone() {
            let outcome = retry(&self.config.handler_retry, &self.cancel, "handler", |_| {
                handler.handle(&event).resolve()
            })
            .await;

            match outcome {
                Ok(outcome) => {
                    self.liveness.record_handler_retries(outcome.attempts - 1);
                }
                Err(RetryError::Cancelled) => return Err(ConsumerError::Cancelled),
                Err(failure) => {
                    let attempts = failure.attempts();
                    self.liveness
                        .record_handler_retries(attempts.saturating_sub(1));
                    let source = failure
                        .into_error()
                        .unwrap_or(relay_core::HandlerError::Declined);
                    return Err(ConsumerError::HandlerFailure {
                        event_id: event.id,
                        attempts,
                        source,
                    });
                }
            }
        }

        let _ = self.checkpoints.on_event_handled(&event, &self.cancel).await?;
        Ok(())
    }

    /// Rebuild the stream on the reconnect backoff schedule.
    async fn reconnect(
        &mut self,
        connector: &dyn StreamConnector,
        backoff: &mut Backoff,
        mut last: ConsumerError,
    ) -> Result<ByteStream, ConsumerError> {
        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(ConsumerError::ConnectionFailure {
                    attempts: backoff.retries(),
                    reason: last.to_string(),
                });
            };
            warn!(
                attempt = backoff.retries(),
                max_retries = backoff.policy().max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "reconnecting"
            );
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Err(ConsumerError::Cancelled);
            }

            self.liveness.record_reconnect();
            self.liveness.set_state(ConsumerState::Connecting);
            let cancel = self.cancel.clone();
            let attempt = tokio::select! {
                attempt = self.connect_once(connector) => attempt,
                () = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            };
            match attempt {
                Ok(stream) => {
                    info!(attempt = backoff.retries(), "event stream re-established");
                    return Ok(stream);
                }
                Err(e) if e.is_retryable() => {
                    self.liveness.set_state(ConsumerState::Reconnecting);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&mut self, connector: &dyn StreamConnector) -> Result<ByteStream, ConsumerError> {
        let resume_id = self.checkpoints.resume_id().await?;
        debug!(resume_id = ?resume_id, "connecting");
        let connection = connector
            .connect(resume_id.as_deref())
            .map_err(ConsumerError::Construction)?;
        connection
            .establish()
            .await
            .map_err(ConsumerError::ConnectionLost)
    }
}
