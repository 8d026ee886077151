use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One dispatched unit of the event stream.
///
/// `id` and `event_type` are whatever the stream last declared when the event
/// was dispatched; `data` is the joined payload of the event's `data:` lines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "event")]
    pub event_type: String,
    pub data: String,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}
