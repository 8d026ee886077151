/// Whether a failure is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Failure reported by an event handler.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler returned a negative acknowledgement.
    #[error("handler declined the event")]
    Declined,
    #[error("handler failed: {0}")]
    Failed(String),
    /// Not retried; the consumer stops.
    #[error("handler aborted: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl Retryable for HandlerError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Failure of the byte stream or of establishing it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("stream closed unexpectedly: {0}")]
    Closed(String),
    #[error("transport error: {0}")]
    Io(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid stream: {0}")]
    Invalid(String),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Closed(_) | Self::Io(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Invalid(_) => false,
        }
    }
}

/// Errors surfaced by the consumer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The stream constructor failed. Never retried.
    #[error("could not establish event stream: {0}")]
    Construction(TransportError),

    #[error("handler gave up on event {event_id:?} after {attempts} attempts: {source}")]
    HandlerFailure {
        event_id: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(TransportError),

    #[error("reconnect gave up after {attempts} attempts: {reason}")]
    ConnectionFailure { attempts: u32, reason: String },

    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("checkpoint store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cancelled")]
    Cancelled,
}

impl ConsumerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Construction(_) => "construction",
            Self::HandlerFailure { .. } => "handler_failure",
            Self::ConnectionLost(_) => "connection_lost",
            Self::ConnectionFailure { .. } => "connection_failure",
            Self::CheckpointWrite(_) => "checkpoint_write",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Retryable for ConsumerError {
    /// Retryable at the connection level: a lost stream, a failed resume
    /// lookup or a failed write.
    fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionLost(e) => e.is_retryable(),
            Self::Store(_) | Self::CheckpointWrite(_) => true,
            _ => false,
        }
    }
}
