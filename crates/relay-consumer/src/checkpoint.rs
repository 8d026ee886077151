use std::sync::Arc;

use chrono::Utc;
use relay_core::checkpoint::{CHECKPOINT_KEY, DEFAULT_MESSAGE_THRESHOLD};
use relay_core::{Checkpoint, ConsumerError, Event, Retryable, RetryPolicy};
use relay_store::{open_store, CheckpointStore};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{retry, RetryError};
use crate::liveness::Liveness;

pub type CheckpointCallback = Arc<dyn Fn(&Checkpoint) + Send + Sync>;

/// What to do when a checkpoint write fails.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CheckpointFailurePolicy {
    /// Log and keep going; the next handled event tries again.
    #[default]
    Continue,
    /// Retry the write before handling the next event, then fall back to
    /// `Continue`.
    Block { retry: RetryPolicy },
}

/// Checkpointing configuration passed to [`crate::Consumer::checkpoint`].
#[derive(Clone)]
pub struct CheckpointOptions {
    pub store: Arc<dyn CheckpointStore>,
    /// Handled events between writes.
    pub messages: u32,
    pub callback: Option<CheckpointCallback>,
    pub on_failure: CheckpointFailurePolicy,
}

impl CheckpointOptions {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            messages: DEFAULT_MESSAGE_THRESHOLD,
            callback: None,
            on_failure: CheckpointFailurePolicy::Continue,
        }
    }

    /// Options backed by the store at `url` (see [`relay_store::open_store`]).
    pub fn from_url(url: &str) -> Result<Self, ConsumerError> {
        Ok(Self::new(open_store(url)?))
    }

    pub fn messages(mut self, messages: u32) -> Self {
        self.messages = messages;
        self
    }

    /// Called after every successful write.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Checkpoint) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn on_failure(mut self, policy: CheckpointFailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    fn validate(&self) -> Result<(), ConsumerError> {
        if self.messages == 0 {
            return Err(ConsumerError::Config(
                "checkpoint message threshold must be at least 1".into(),
            ));
        }
        if let CheckpointFailurePolicy::Block { retry } = &self.on_failure {
            retry.validate()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointOptions")
            .field("store", &self.store.name())
            .field("messages", &self.messages)
            .field("callback", &self.callback.is_some())
            .field("on_failure", &self.on_failure)
            .finish()
    }
}

/// Counts handled events and writes a checkpoint every `messages` events.
///
/// The counter resets only after a successful write, so a failed write is
/// attempted again on the next handled event.
pub struct CheckpointManager {
    options: Option<CheckpointOptions>,
    message_count: u32,
    liveness: Liveness,
}

impl CheckpointManager {
    pub fn new(liveness: Liveness) -> Self {
        Self {
            options: None,
            message_count: 0,
            liveness,
        }
    }

    pub fn configure(&mut self, options: CheckpointOptions) -> Result<(), ConsumerError> {
        options.validate()?;
        info!(
            store = options.store.name(),
            messages = options.messages,
            "checkpointing enabled"
        );
        self.options = Some(options);
        self.message_count = 0;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.options.is_some()
    }

    /// Events handled since the last successful write.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// Id of the last stored checkpoint. A stored value that does not parse
    /// is treated as absent.
    pub async fn resume_id(&self) -> Result<Option<String>, ConsumerError> {
        let Some(options) = &self.options else {
            return Ok(None);
        };
        let Some(raw) = options.store.get(CHECKPOINT_KEY).await? else {
            debug!("no stored checkpoint");
            return Ok(None);
        };
        match Checkpoint::from_json(&raw) {
            Ok(checkpoint) => {
                debug!(id = %checkpoint.id, "resuming from checkpoint");
                Ok(Some(checkpoint.id))
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable checkpoint");
                Ok(None)
            }
        }
    }

    /// Record a handled event; write a checkpoint when the threshold is hit.
    /// Returns the checkpoint written, if any.
    ///
    /// A failed write is logged and leaves the count in place. The only error
    /// is [`ConsumerError::Cancelled`], when `cancel` fires mid-write.
    pub async fn on_event_handled(
        &mut self,
        event: &Event,
        cancel: &CancellationToken,
    ) -> Result<Option<Checkpoint>, ConsumerError> {
        let now = Utc::now();
        self.liveness.record_handled(now);

        let Some(options) = self.options.as_ref() else {
            return Ok(None);
        };
        self.message_count = self.message_count.saturating_add(1);
        if self.message_count < options.messages {
            return Ok(None);
        }

        let checkpoint = Checkpoint::new(event.id.clone(), now);
        let result = match &options.on_failure {
            CheckpointFailurePolicy::Continue => tokio::select! {
                result = write(options.store.as_ref(), &checkpoint) => result,
                () = cancel.cancelled() => Err(ConsumerError::Cancelled),
            },
            CheckpointFailurePolicy::Block { retry: policy } => {
                let store = options.store.as_ref();
                retry(policy, cancel, "checkpoint_write", |_| write(store, &checkpoint))
                    .await
                    .map(|outcome| outcome.value)
                    .map_err(|e| match e {
                        RetryError::Cancelled => ConsumerError::Cancelled,
                        other => other
                            .into_error()
                            .unwrap_or_else(|| ConsumerError::CheckpointWrite("gave up".into())),
                    })
            }
        };

        match result {
            Ok(()) => {
                self.message_count = 0;
                self.liveness.record_checkpoint();
                info!(id = %checkpoint.id, "checkpoint written");
                if let Some(callback) = &options.callback {
                    callback(&checkpoint);
                }
                Ok(Some(checkpoint))
            }
            Err(ConsumerError::Cancelled) => {
                debug!(id = %checkpoint.id, "checkpoint write abandoned");
                Err(ConsumerError::Cancelled)
            }
            Err(e) => {
                self.liveness.record_checkpoint_failure();
                warn!(
                    id = %checkpoint.id,
                    pending = self.message_count,
                    retryable = e.is_retryable(),
                    error = %e,
                    "checkpoint write failed"
                );
                Ok(None)
            }
        }
    }
}

async fn write(store: &dyn CheckpointStore, checkpoint: &Checkpoint) -> Result<(), ConsumerError> {
    let value = checkpoint
        .to_json()
        .map_err(|e| ConsumerError::CheckpointWrite(e.to_string()))?;
    store
        .set(CHECKPOINT_KEY, &value)
        .await
        .map_err(|e| ConsumerError::CheckpointWrite(e.to_string()))
}
