use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store key under which the checkpoint lives.
pub const CHECKPOINT_KEY: &str = "checkpoint";

/// Default number of handled events between checkpoint writes.
pub const DEFAULT_MESSAGE_THRESHOLD: u32 = 3;

/// Durable resume point: the last successfully handled event.
///
/// Stored as `{"lastProcessed": <epoch-ms>, "id": "<string>"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "lastProcessed", with = "chrono::serde::ts_milliseconds")]
    pub last_processed_at: DateTime<Utc>,
    pub id: String,
}

impl Checkpoint {
    /// Timestamps are truncated to milliseconds to match the stored form.
    pub fn new(id: impl Into<String>, last_processed_at: DateTime<Utc>) -> Self {
        let millis = last_processed_at.timestamp_millis();
        Self {
            last_processed_at: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(last_processed_at),
            id: id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
