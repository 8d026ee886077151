//! # relay-core
//!
//! Shared vocabulary for the relay consumer:
//!
//! - **Events**: [`event::Event`] records produced from the wire format
//! - **Parser**: [`parser::EventParser`], the line-at-a-time SSE state machine
//! - **Retry**: [`retry::RetryPolicy`] and backoff calculation
//! - **Checkpoints**: [`checkpoint::Checkpoint`] and its stored JSON shape
//! - **Errors**: [`errors::ConsumerError`] and the [`errors::Retryable`] classification

pub mod checkpoint;
pub mod errors;
pub mod event;
pub mod parser;
pub mod retry;

pub use checkpoint::Checkpoint;
pub use errors::{ConsumerError, HandlerError, Retryable, TransportError};
pub use event::Event;
pub use parser::EventParser;
pub use retry::RetryPolicy;
