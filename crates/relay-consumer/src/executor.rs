//! # Retry executor
//!
//! Runs an async operation under a [`RetryPolicy`], sleeping on the policy's
//! backoff schedule between attempts.
//!
//! - Errors classified as non-retryable end the loop at once
//! - The wait between attempts and the attempt itself are raced against a
//!   [`CancellationToken`]; cancellation wins without another attempt
//! - [`Backoff`] exposes the schedule for loops that drive their own attempts

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use relay_core::{Retryable, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Tracks the retry budget of one operation.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Start the schedule over from the minimum delay.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Successful result of a retried operation.
#[derive(Clone, Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Total attempts made (1-based).
    pub attempts: u32,
    /// Total time spent waiting between attempts.
    pub total_delay: Duration,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt in the budget failed.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop early.
    Aborted { attempts: u32, error: E },
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Aborted { attempts, .. } => *attempts,
            Self::Cancelled => 0,
        }
    }

    /// The error that ended the loop, if it was not a cancellation.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Aborted { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts the
/// policy, or `cancel` fires. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut backoff = Backoff::new(policy.clone());
    let mut total_delay = Duration::ZERO;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let attempt = backoff.retries() + 1;

        let result = tokio::select! {
            result = op(attempt) => result,
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
        };

        let error = match result {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                    total_delay,
                })
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(RetryError::Aborted {
                attempts: attempt,
                error,
            });
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        };

        warn!(
            operation = label,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after error"
        );

        if !sleep_or_cancel(delay, cancel).await {
            return Err(RetryError::Cancelled);
        }
        total_delay += delay;
    }
}
