//! One streaming upstream request per call.
//!
//! Writes the opaque request payload, checks the response status, then
//! yields decoded events at frame boundaries. Cancellation works by
//! dropping the returned stream: the response body (and its connection)
//! is dropped with it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::RETRY_AFTER;
use tokio_stream::StreamExt;
use tracing::{instrument, warn};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;

use warpflow_core::Config;

use crate::codec::EventCodec;
use crate::errors::TransportError;
use crate::events::{EventStream, WarpEvent};
use crate::sse::parse_sse_events;

/// Bytes of an error body kept for classification.
const ERROR_BODY_SNIPPET: usize = 4096;

/// Configuration for the upstream transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Streaming send endpoint.
    pub send_url: String,
    /// Maximum quiet time between frames before the stream is abandoned.
    pub read_idle_timeout: Duration,
    /// Client version header value.
    pub client_version: String,
    /// OS category header value.
    pub os_category: String,
    /// OS name header value.
    pub os_name: String,
    /// OS version header value.
    pub os_version: String,
}

impl TransportConfig {
    /// Build from the gateway configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            send_url: config.upstream_send_url.clone(),
            read_idle_timeout: Duration::from_secs(config.upstream_read_idle_timeout_seconds),
            client_version: config.client_version.clone(),
            os_category: config.os_category.clone(),
            os_name: config.os_name.clone(),
            os_version: config.os_version.clone(),
        }
    }
}

/// Issues streaming upstream requests bearing an access token.
pub struct UpstreamTransport {
    client: reqwest::Client,
    config: TransportConfig,
    codec: Arc<dyn EventCodec>,
}

impl UpstreamTransport {
    /// Create a transport sharing the gateway's HTTP client.
    pub fn new(
        client: reqwest::Client,
        config: TransportConfig,
        codec: Arc<dyn EventCodec>,
    ) -> Self {
        Self {
            client,
            config,
            codec,
        }
    }

    /// Send one request and return the lazy event stream.
    ///
    /// Non-success statuses are returned as [`TransportError::Status`]
    /// with the `Retry-After` header and a body snippet for the failure
    /// classifier. After a success status, failures surface in-band as a
    /// terminal [`WarpEvent::Error`].
    #[instrument(skip_all, fields(url = %self.config.send_url))]
    pub async fn send(
        &self,
        access_token: &str,
        request_bytes: Bytes,
    ) -> Result<EventStream, TransportError> {
        let resp = self
            .client
            .post(&self.config.send_url)
            .bearer_auth(access_token)
            .header("x-warp-client-id", "warp-app")
            .header("x-warp-client-version", &self.config.client_version)
            .header("x-warp-os-category", &self.config.os_category)
            .header("x-warp-os-name", &self.config.os_name)
            .header("x-warp-os-version", &self.config.os_version)
            .header("content-type", "application/x-protobuf")
            .header("accept", "text/event-stream")
            .header("accept-encoding", "identity")
            .body(request_bytes)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(ERROR_BODY_SNIPPET)
                .collect();
            return Err(TransportError::Status {
                status,
                retry_after,
                body,
            });
        }

        let codec = Arc::clone(&self.codec);
        let idle = self.config.read_idle_timeout;
        let payloads = parse_sse_events(Box::pin(resp.bytes_stream()));

        Ok(Box::pin(async_stream::stream! {
            let mut payloads = std::pin::pin!(payloads);
            loop {
                let next = match tokio::time::timeout(idle, payloads.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield WarpEvent::Error {
                            message: format!(
                                "upstream read timed out after {}s of silence",
                                idle.as_secs()
                            ),
                        };
                        break;
                    }
                };

                match next {
                    None => break,
                    Some(Err(e)) => {
                        yield WarpEvent::Error {
                            message: format!("upstream connection failed mid-stream: {e}"),
                        };
                        break;
                    }
                    Some(Ok(payload)) => {
                        let Some(frame) = decode_frame_payload(&payload) else {
                            warn!("skipping undecodable frame payload");
                            continue;
                        };
                        match codec.decode(&frame) {
                            Ok(events) => {
                                let mut terminal = false;
                                for event in events {
                                    terminal = event.is_terminal();
                                    yield event;
                                    if terminal {
                                        break;
                                    }
                                }
                                if terminal {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "skipping frame the codec rejected");
                            }
                        }
                    }
                }
            }
        }))
    }
}

/// Base64-decode one SSE payload into frame bytes.
///
/// Upstream uses url-safe base64; standard alphabet is tolerated.
fn decode_frame_payload(payload: &str) -> Option<Vec<u8>> {
    let s = payload.trim();
    if s.is_empty() {
        return None;
    }
    let padded = pad_base64(s);
    URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .ok()
}

fn pad_base64(s: &str) -> String {
    let rem = s.len() % 4;
    if rem == 0 {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 4 - rem);
    out.push_str(s);
    for _ in 0..(4 - rem) {
        out.push('=');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_url_safe_payload() {
        let encoded = URL_SAFE.encode(b"{\"finished\":{}}");
        assert_eq!(
            decode_frame_payload(&encoded).unwrap(),
            b"{\"finished\":{}}"
        );
    }

    #[test]
    fn decodes_standard_payload() {
        let encoded = STANDARD.encode(b"\xfb\xff\x01binary");
        assert_eq!(decode_frame_payload(&encoded).unwrap(), b"\xfb\xff\x01binary");
    }

    #[test]
    fn tolerates_missing_padding() {
        let encoded = URL_SAFE.encode(b"abcde");
        let stripped = encoded.trim_end_matches('=');
        assert_eq!(decode_frame_payload(stripped).unwrap(), b"abcde");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode_frame_payload("!!not base64!!"), None);
        assert_eq!(decode_frame_payload(""), None);
    }
}
