//! Server-Sent Events line splitting for streaming chat completions.
//!
//! Bytes are buffered until a full line is available, then the `data:`
//! payload is extracted. Comments, other SSE fields and empty payloads are
//! skipped. The `[DONE]` marker ends the stream.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::error::EngineError;

/// Terminal marker sent by OpenAI-compatible servers.
const DONE_MARKER: &str = "[DONE]";

/// A parsed SSE data line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseData {
    /// A JSON payload.
    Json(String),
    /// The `[DONE]` marker.
    Done,
}

/// Split a byte stream into SSE data payloads.
///
/// A transport error ends the stream after yielding it. Any trailing bytes
/// without a newline are processed once the body ends.
pub fn parse_sse_lines<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<SseData, EngineError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<EngineError> + Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        tracing::warn!("skipping SSE line with invalid UTF-8");
                        continue;
                    };

                    if let Some(data) = extract_sse_data(line) {
                        let finished = data == SseData::Done;
                        return Some((Ok(data), (stream, buffer, finished)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (stream, buffer, true))),
                    None => {
                        let rest = std::str::from_utf8(&buffer).ok().and_then(extract_sse_data);
                        buffer.clear();
                        return rest.map(|data| (Ok(data), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

/// Extract the data payload from one SSE line.
///
/// Returns `None` for comments, blank lines, non-data fields and empty data.
pub fn extract_sse_data(line: &str) -> Option<SseData> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|d| !d.is_empty())?;

    if data == DONE_MARKER {
        Some(SseData::Done)
    } else {
        Some(SseData::Json(data.to_string()))
    }
}
