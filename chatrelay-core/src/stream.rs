//! Streaming primitives used by the relay.
//!
//! Contract for decoded event streams:
//! - 0..n `Chunk` events, in upstream emission order.
//! - At most one terminal event (`Done` or `Error`); nothing follows it.
//! - An upstream that closes without `[DONE]` simply ends the stream.
//!
//! `StreamEvent` does not derive `Clone` / `PartialEq` because `Error` carries
//! `RelayError`.

use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::buffer::ContentBuffer;
use crate::error::{CoreResult, RelayError};
use crate::http_client::SseStream;
use crate::model::ChatCompletionChunk;

/// Raw upstream body, as forwarded to the caller in `stream` mode.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    /// One decoded `data:` payload.
    Chunk(ChatCompletionChunk),
    /// The `[DONE]` marker.
    Done,
    /// Transport or decode failure; the stream ends after this.
    Error(RelayError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Convenience accessor for the primary delta text of a `Chunk`.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::Chunk(c) => c.primary_content(),
            _ => None,
        }
    }
}

/// Boxed stream of decoded events.
pub type BoxStreamEv = BoxStream<'static, StreamEvent>;

/// Decode one SSE line. Comments, `event:` lines, blank lines and empty data
/// payloads yield `None`.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data).trim_end();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }
    Some(match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => StreamEvent::Chunk(chunk),
        Err(e) => StreamEvent::Error(RelayError::ProviderError {
            provider: "sse".into(),
            code: "decode".into(),
            message: format!("chunk decode error: {e}"),
        }),
    })
}

/// Turn an SSE line stream into decoded events, stopping after the first
/// terminal event.
pub fn chunk_events(lines: SseStream) -> BoxStreamEv {
    lines
        .filter_map(|line| async move {
            match line {
                Ok(l) => decode_line(&l.line),
                Err(e) => Some(StreamEvent::Error(e)),
            }
        })
        .scan(false, |ended, ev| {
            let out = if *ended {
                None
            } else {
                *ended = ev.is_terminal();
                Some(ev)
            };
            futures::future::ready(out)
        })
        .boxed()
}

/// Drain an event stream into a content buffer.
pub async fn collect_reply(mut events: BoxStreamEv) -> CoreResult<ContentBuffer> {
    let mut buf = ContentBuffer::new();
    while let Some(ev) = events.next().await {
        match ev {
            StreamEvent::Chunk(chunk) => buf.push_chunk(&chunk),
            StreamEvent::Done => break,
            StreamEvent::Error(e) => return Err(e),
        }
    }
    Ok(buf)
}

/// SSE framing for a collected reply: one `data:` event carrying the whole
/// reply (one `data:` line per reply line), then an `end` event.
pub fn reply_frames(reply: &str) -> String {
    let mut out = String::with_capacity(reply.len() + 32);
    for line in reply.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str("event: end\ndata: \n\n");
    out
}
