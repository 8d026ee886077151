//! Byte sources and the connector seam.
//!
//! A [`StreamConnector`] is called with the id to resume from and returns a
//! [`Connection`]: either a stream that is ready now, or a future that
//! settles into one. The consumer calls it again after every lost connection.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use relay_core::TransportError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub enum Connection {
    Ready(ByteStream),
    Pending(BoxFuture<'static, Result<ByteStream, TransportError>>),
}

impl Connection {
    pub fn ready<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    {
        Self::Ready(stream.boxed())
    }

    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = Result<ByteStream, TransportError>> + Send + 'static,
    {
        Self::Pending(fut.boxed())
    }

    /// Wait for a pending connection to settle.
    pub async fn establish(self) -> Result<ByteStream, TransportError> {
        match self {
            Self::Ready(stream) => Ok(stream),
            Self::Pending(fut) => fut.await,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Connection::Ready"),
            Self::Pending(_) => f.write_str("Connection::Pending"),
        }
    }
}

/// Opens the byte stream. An `Err` returned directly is a construction
/// failure and is never retried; a `Pending` connection that later fails
/// is retried when the error is retryable.
pub trait StreamConnector: Send + Sync {
    fn connect(&self, resume_id: Option<&str>) -> Result<Connection, TransportError>;
}

impl<F> StreamConnector for F
where
    F: Fn(Option<&str>) -> Result<Connection, TransportError> + Send + Sync,
{
    fn connect(&self, resume_id: Option<&str>) -> Result<Connection, TransportError> {
        self(resume_id)
    }
}

/// Pulls chunks off a [`ByteStream`] on its own task, up to `capacity`
/// chunks ahead of the consumer. The task stops after the first error.
pub(crate) struct ChunkReader {
    rx: mpsc::Receiver<Result<Bytes, TransportError>>,
    task: JoinHandle<()>,
}

impl ChunkReader {
    pub(crate) fn spawn(mut stream: ByteStream, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    /// `None` once the stream has ended normally.
    pub(crate) async fn next(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}
