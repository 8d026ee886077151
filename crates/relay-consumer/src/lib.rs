//! # relay-consumer
//!
//! Resumable consumer for Server-Sent Event streams.
//!
//! - [`Consumer`]: drives one stream through parsing, handling and
//!   checkpointing, reconnecting on loss
//! - [`StreamConnector`]: the seam that opens a byte stream from a resume id
//! - [`EventHandler`] / [`Reply`]: per-event acknowledgement, now or later
//! - [`CheckpointOptions`]: where and how often progress is persisted
//! - [`Liveness`]: shared read-only view for health checks

pub mod checkpoint;
pub mod consumer;
pub mod executor;
pub mod handler;
pub mod lines;
pub mod liveness;
pub mod source;

pub use checkpoint::{CheckpointFailurePolicy, CheckpointManager, CheckpointOptions};
pub use consumer::{Consumer, ConsumerConfig};
pub use executor::{retry, Backoff, RetryError, RetryOutcome};
pub use handler::{EventHandler, Reply};
pub use liveness::{ConsumerState, Liveness, LivenessSnapshot};
pub use source::{ByteStream, Connection, StreamConnector};

pub use relay_core::{Checkpoint, ConsumerError, Event, HandlerError, RetryPolicy, TransportError};
