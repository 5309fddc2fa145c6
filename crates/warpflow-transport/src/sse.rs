//! Server-sent-event framing for the upstream stream.
//!
//! The upstream protocol frames one event as a run of `data:` lines
//! terminated by a blank line; the payloads of a run are concatenated
//! before decoding. This parser handles:
//! - line buffering from chunked responses
//! - `data:` prefix extraction and comment skipping
//! - blank-line event boundaries with multi-line payload joining
//! - a trailing unterminated event at end of stream
//!
//! Read errors are yielded as the final item so the transport can surface
//! them as a terminal error event instead of a silent end.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;

/// Parse SSE framing from a byte stream and yield joined event payloads.
///
/// The last item may be `Err` when the underlying read failed mid-stream;
/// the stream always ends after it.
pub fn parse_sse_events<S>(byte_stream: S) -> impl Stream<Item = Result<String, reqwest::Error>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), Vec::new(), false),
        move |(mut stream, mut buffer, mut pending, done)| async move {
            if done {
                return None;
            }

            loop {
                // Drain complete lines out of the buffer first.
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let line = match std::str::from_utf8(&line_bytes) {
                        Ok(s) => s,
                        Err(_) => continue, // skip invalid UTF-8 lines
                    };

                    if line.is_empty() {
                        // Event boundary.
                        if !pending.is_empty() {
                            let payload = pending.join("");
                            pending.clear();
                            return Some((Ok(payload), (stream, buffer, pending, false)));
                        }
                        continue;
                    }

                    if let Some(data) = extract_sse_data(line) {
                        pending.push(data);
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer, pending, true)));
                    }
                    None => {
                        // Stream ended — flush any unterminated event.
                        if !buffer.is_empty() {
                            if let Ok(line) = std::str::from_utf8(&buffer) {
                                if let Some(data) = extract_sse_data(line.trim()) {
                                    pending.push(data);
                                }
                            }
                            buffer.clear();
                        }
                        if !pending.is_empty() {
                            let payload = pending.join("");
                            pending.clear();
                            return Some((Ok(payload), (stream, buffer, pending, true)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// Extract the payload from one `data:` line.
///
/// Returns `None` for comments and non-data fields.
fn extract_sse_data(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    Some(data.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    async fn collect(chunks: Vec<&'static str>) -> Vec<String> {
        parse_sse_events(byte_stream(chunks))
            .map(|r| r.expect("no read errors in test input"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn single_event() {
        let events = collect(vec!["data: abc\n\n"]).await;
        assert_eq!(events, vec!["abc"]);
    }

    #[tokio::test]
    async fn multi_line_payloads_are_joined() {
        let events = collect(vec!["data: part1\ndata: part2\n\n"]).await;
        assert_eq!(events, vec!["part1part2"]);
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let events = collect(vec!["data: ab", "c\n\ndata: def\n", "\n"]).await;
        assert_eq!(events, vec!["abc", "def"]);
    }

    #[tokio::test]
    async fn comments_and_other_fields_are_skipped() {
        let events = collect(vec![": keepalive\nevent: message\ndata: x\n\n"]).await;
        assert_eq!(events, vec!["x"]);
    }

    #[tokio::test]
    async fn crlf_lines_are_handled() {
        let events = collect(vec!["data: x\r\n\r\n"]).await;
        assert_eq!(events, vec!["x"]);
    }

    #[tokio::test]
    async fn unterminated_trailing_event_is_flushed() {
        let events = collect(vec!["data: tail"]).await;
        assert_eq!(events, vec!["tail"]);
    }

    #[tokio::test]
    async fn no_data_no_events() {
        let events = collect(vec![": ping\n\n"]).await;
        assert!(events.is_empty());
    }

    #[test]
    fn extract_data_variants() {
        assert_eq!(extract_sse_data("data: x"), Some("x".into()));
        assert_eq!(extract_sse_data("data:x"), Some("x".into()));
        assert_eq!(extract_sse_data("data:"), None);
        assert_eq!(extract_sse_data(": comment"), None);
        assert_eq!(extract_sse_data("id: 3"), None);
    }
}
