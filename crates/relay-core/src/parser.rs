//! # SSE event parser
//!
//! State machine turning SSE lines into [`Event`]s. Lines are fed one at a
//! time (already split on `\n`); a blank line closes the current event.
//!
//! - `data:` lines accumulate, joined with `\n`
//! - `id:` and `event:` are sticky until overwritten
//! - `retry:`, comments and unknown fields are accepted and ignored
//! - an `event:` line naming the ticker type marks the block as a heartbeat;
//!   it is absorbed without producing an event

use crate::event::Event;

/// Event type used by servers for keep-alive heartbeats.
pub const DEFAULT_TICKER_TYPE: &str = "ticker";

const DATA_FIELD: &str = "data";
const ID_FIELD: &str = "id";
const EVENT_FIELD: &str = "event";

pub struct EventParser {
    data: String,
    id: String,
    event_type: String,
    ticker_type: String,
    // Set by a ticker `event:` line, cleared at the next blank line.
    suppressing: bool,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    pub fn new() -> Self {
        Self::with_ticker_type(DEFAULT_TICKER_TYPE)
    }

    pub fn with_ticker_type(ticker_type: impl Into<String>) -> Self {
        Self {
            data: String::new(),
            id: String::new(),
            event_type: String::new(),
            ticker_type: ticker_type.into(),
            suppressing: false,
        }
    }

    /// Feed one line. Returns an event when the line closes a block that
    /// carried data.
    pub fn feed(&mut self, line: &str) -> Option<Event> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }

        let (field, value) = split_field(line)?;
        match field {
            EVENT_FIELD => {
                self.event_type = value.to_string();
                if self.event_type == self.ticker_type {
                    self.suppressing = true;
                }
            }
            DATA_FIELD => {
                if !self.suppressing {
                    if !self.data.is_empty() {
                        self.data.push('\n');
                    }
                    self.data.push_str(value);
                }
            }
            ID_FIELD => self.id = value.to_string(),
            // retry: and anything unrecognised
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        if self.suppressing {
            self.suppressing = false;
            self.data.clear();
            return None;
        }
        if self.data.is_empty() {
            return None;
        }
        Some(Event {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            data: std::mem::take(&mut self.data),
        })
    }

    pub fn current_id(&self) -> &str {
        &self.id
    }

    pub fn current_type(&self) -> &str {
        &self.event_type
    }

    /// Whether `data:` lines are buffered but not yet dispatched.
    pub fn has_pending_data(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Split `name: value` into its parts. A single space after the colon is
/// part of the separator. Comment lines (leading `:`) and lines without a
/// colon yield `None`.
fn split_field(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(':') {
        return None;
    }
    let (field, value) = line.split_once(':')?;
    Some((field, value.strip_prefix(' ').unwrap_or(value)))
}
