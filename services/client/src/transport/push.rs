//! HTTP push transport: one POST per query, answered by a server-sent event stream.

use super::{FrameStream, PushConnector, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpPushConnector {
    client: reqwest::Client,
    url: String,
}

impl HttpPushConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushConnector for HttpPushConnector {
    async fn post(&self, frame: String) -> Result<FrameStream, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .body(frame)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        debug!(status = %response.status(), "push stream opened");

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Http(e.to_string())));
        Ok(sse_data_frames(bytes).boxed())
    }
}

/// Splits a byte stream into server-sent event payloads.
///
/// Consecutive `data:` lines form one event, joined with `\n`, and a blank
/// line dispatches it. Comments, `event:`/`id:` fields and invalid UTF-8 are
/// skipped. A transport error drops the pending event and ends the stream
/// after it is yielded.
pub fn sse_data_frames<S>(bytes: S) -> impl Stream<Item = Result<String, TransportError>> + Send
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    futures::stream::unfold(
        (bytes.boxed(), BytesMut::with_capacity(8192), None::<String>, false),
        |(mut bytes, mut buffer, mut pending, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line = buffer.split_to(newline + 1);
                    match classify(&line) {
                        Line::Data(data) => append(&mut pending, &data),
                        Line::Dispatch => {
                            if let Some(event) = pending.take().filter(|e| !e.is_empty()) {
                                return Some((Ok(event), (bytes, buffer, None, false)));
                            }
                        }
                        Line::Ignore => {}
                    }
                    continue;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (bytes, buffer, None, true))),
                    None => {
                        // Unterminated trailing line, then whatever was pending.
                        let rest = buffer.split();
                        if let Line::Data(data) = classify(&rest) {
                            append(&mut pending, &data);
                        }
                        return pending
                            .filter(|e| !e.is_empty())
                            .map(|event| (Ok(event), (bytes, buffer, None, true)));
                    }
                }
            }
        },
    )
}

enum Line {
    Data(String),
    Dispatch,
    Ignore,
}

fn classify(line: &[u8]) -> Line {
    let Ok(line) = std::str::from_utf8(line) else {
        warn!("skipping non-UTF-8 event-stream line");
        return Line::Ignore;
    };
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Line::Dispatch;
    }
    match line.strip_prefix("data:") {
        Some(data) => Line::Data(data.strip_prefix(' ').unwrap_or(data).to_string()),
        None => Line::Ignore,
    }
}

fn append(pending: &mut Option<String>, data: &str) {
    match pending {
        Some(event) => {
            event.push('\n');
            event.push_str(data);
        }
        None => *pending = Some(data.to_string()),
    }
}
