//! Retry policy and backoff calculation.
//!
//! The async execution loop lives in `relay-consumer`; this module holds the
//! portable pieces:
//!
//! - [`RetryPolicy`]: retry budget and delay bounds
//! - [`calculate_backoff_delay`]: bounded exponential backoff with optional jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConsumerError;

/// Default handler retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default handler minimum delay in milliseconds.
pub const DEFAULT_MIN_DELAY_MS: u64 = 1000;
/// Default handler maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default reconnect retry budget.
pub const RECONNECT_MAX_RETRIES: u32 = 10_000;
/// Default reconnect minimum delay in milliseconds.
pub const RECONNECT_MIN_DELAY_MS: u64 = 50;
/// Default reconnect maximum delay in milliseconds.
pub const RECONNECT_MAX_DELAY_MS: u64 = 2000;

/// Retry budget and delay bounds.
///
/// `max_retries` counts retries after the first attempt, so an operation runs
/// at most `max_retries + 1` times.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    #[serde(alias = "retries")]
    pub max_retries: u32,
    #[serde(alias = "minTimeout")]
    pub min_delay_ms: u64,
    #[serde(alias = "maxTimeout")]
    pub max_delay_ms: u64,
    #[serde(alias = "randomizeBackoff")]
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Policy used for rebuilding a lost connection.
    pub fn reconnect() -> Self {
        Self {
            max_retries: RECONNECT_MAX_RETRIES,
            min_delay_ms: RECONNECT_MIN_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            randomize: true,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let random = if self.randomize { rand::random::<f64>() } else { 0.0 };
        Duration::from_millis(calculate_backoff_delay(
            retry,
            self.min_delay_ms,
            self.max_delay_ms,
            random,
        ))
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.max_delay_ms < self.min_delay_ms {
            return Err(ConsumerError::Config(format!(
                "retry max delay {}ms is below min delay {}ms",
                self.max_delay_ms, self.min_delay_ms
            )));
        }
        Ok(())
    }
}

/// Calculate a bounded exponential backoff delay.
///
/// Formula: `clamp(min_delay * 2^retry * (1 + random), min_delay, max_delay)`
///
/// `random` is expected in `[0.0, 1.0)`; pass `0.0` for a deterministic
/// schedule. Values outside that range are clamped.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn calculate_backoff_delay(
    retry: u32,
    min_delay_ms: u64,
    max_delay_ms: u64,
    random: f64,
) -> u64 {
    let exponential = min_delay_ms.saturating_mul(1u64 << retry.min(31));
    let scaled = (exponential as f64) * (1.0 + random.clamp(0.0, 1.0));
    let upper = max_delay_ms.max(min_delay_ms);
    (scaled.round() as u64).clamp(min_delay_ms, upper)
}
