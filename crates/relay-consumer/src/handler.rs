use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use relay_core::{Event, HandlerError};

/// What a handler hands back for one event: an answer now, or one later.
///
/// `Ok(true)` acknowledges the event. `Ok(false)` declines it and counts as
/// a retryable failure, same as `Err(HandlerError::Failed(_))`.
pub enum Reply {
    Ready(Result<bool, HandlerError>),
    Deferred(BoxFuture<'static, Result<bool, HandlerError>>),
}

impl Reply {
    pub fn ack() -> Self {
        Self::Ready(Ok(true))
    }

    pub fn decline() -> Self {
        Self::Ready(Ok(false))
    }

    pub fn fail(message: impl std::fmt::Display) -> Self {
        Self::Ready(Err(HandlerError::failed(message)))
    }

    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Result<bool, HandlerError>> + Send + 'static,
    {
        Self::Deferred(fut.boxed())
    }

    /// Wait for the answer. A decline becomes [`HandlerError::Declined`].
    pub async fn resolve(self) -> Result<(), HandlerError> {
        let acknowledged = match self {
            Self::Ready(result) => result?,
            Self::Deferred(fut) => fut.await?,
        };
        if acknowledged {
            Ok(())
        } else {
            Err(HandlerError::Declined)
        }
    }
}

impl From<bool> for Reply {
    fn from(acknowledged: bool) -> Self {
        Self::Ready(Ok(acknowledged))
    }
}

impl From<Result<bool, HandlerError>> for Reply {
    fn from(result: Result<bool, HandlerError>) -> Self {
        Self::Ready(result)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Receives each parsed event. Invoked again for the same event on retry,
/// so side effects should be idempotent.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Reply;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Reply + Send + Sync,
{
    fn handle(&self, event: &Event) -> Reply {
        self(event)
    }
}
