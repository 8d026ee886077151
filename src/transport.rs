//! HTTP transport for the `relay` binary: opens the event stream with
//! reqwest and hands the body to the consumer as raw chunks.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use relay_consumer::{ByteStream, Connection, StreamConnector, TransportError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use tracing::debug;

const LAST_EVENT_ID: &str = "last-event-id";

/// Longest error body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

pub struct HttpConnector {
    client: reqwest::Client,
    url: reqwest::Url,
    headers: HeaderMap,
    idle_timeout: Option<Duration>,
    reconnect_on_eof: bool,
}

impl HttpConnector {
    pub fn new(
        url: &str,
        headers: &BTreeMap<String, String>,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| TransportError::Invalid(format!("stream url {url:?}: {e}")))?;

        let mut header_map = HeaderMap::new();
        let _ = header_map.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let _ = header_map.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Invalid(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Invalid(format!("header {name}: {e}")))?;
            let _ = header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Invalid(format!("http client: {e}")))?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            idle_timeout,
            reconnect_on_eof: true,
        })
    }

    /// Whether a clean end of the response body counts as a lost connection
    /// (the default) or as the end of the stream.
    pub fn reconnect_on_eof(mut self, reconnect: bool) -> Self {
        self.reconnect_on_eof = reconnect;
        self
    }

    fn request_headers(&self, resume_id: Option<&str>) -> Result<HeaderMap, TransportError> {
        let mut headers = self.headers.clone();
        if let Some(id) = resume_id {
            let value = HeaderValue::from_str(id)
                .map_err(|e| TransportError::Invalid(format!("resume id {id:?}: {e}")))?;
            let _ = headers.insert(HeaderName::from_static(LAST_EVENT_ID), value);
        }
        Ok(headers)
    }
}

impl StreamConnector for HttpConnector {
    fn connect(&self, resume_id: Option<&str>) -> Result<Connection, TransportError> {
        let request = self
            .client
            .get(self.url.clone())
            .headers(self.request_headers(resume_id)?);
        let idle_timeout = self.idle_timeout;
        let reconnect_on_eof = self.reconnect_on_eof;
        debug!(url = %self.url, resume_id = ?resume_id, "requesting event stream");

        Ok(Connection::pending(async move {
            let response = request.send().await.map_err(map_reqwest_error)?;
            let status = response.status();
            if !status.is_success() {
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(map_reqwest_error));
            let chunks: ByteStream = if reconnect_on_eof {
                eof_as_closed(body).boxed()
            } else {
                body.boxed()
            };
            let stream: ByteStream = match idle_timeout {
                Some(idle) => with_idle_timeout(chunks, idle).boxed(),
                None => chunks.boxed(),
            };
            Ok(stream)
        }))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Invalid(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

/// Turn a clean end of `chunks` into a trailing [`TransportError::Closed`].
fn eof_as_closed<S>(chunks: S) -> impl Stream<Item = Result<Bytes, TransportError>> + Send
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    chunks.chain(futures::stream::once(async {
        Err(TransportError::Closed("server closed the event stream".into()))
    }))
}

/// End the stream with [`TransportError::Closed`] when no chunk arrives
/// within `idle`.
fn with_idle_timeout<S>(
    chunks: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, TransportError>> + Send
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    futures::stream::unfold(Some(chunks.boxed()), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(idle, chunks.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransportError::Closed(format!(
                    "no data for {}ms",
                    idle.as_millis()
                ))),
                None,
            )),
        }
    })
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
