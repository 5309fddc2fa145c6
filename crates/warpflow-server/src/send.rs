//! Raw upstream send endpoint.
//!
//! `POST /api/send` takes an opaque, already-encoded request body and
//! streams the decoded upstream events back as server-sent events. This
//! is the single client-facing path into the dispatch pipeline; protocol
//! adapters sit in front of it and never talk upstream themselves.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use metrics::counter;
use serde_json::json;
use tracing::instrument;

use warpflow_core::GatewayError;

use crate::metrics::SEND_REQUESTS_TOTAL;
use crate::state::AppState;

/// Dispatch one opaque request and stream events back.
#[instrument(skip_all, fields(bytes = body.len()))]
pub async fn send(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        counter!(SEND_REQUESTS_TOTAL, "outcome" => "invalid").increment(1);
        return gateway_error_response(&GatewayError::RequestInvalid {
            detail: "empty request body".into(),
        });
    }

    match state.dispatcher.dispatch(body).await {
        Ok(stream) => {
            counter!(SEND_REQUESTS_TOTAL, "outcome" => "ok").increment(1);
            let events = stream.map(|event| {
                Ok::<_, Infallible>(
                    Event::default()
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().data("{}")),
                )
            });
            Sse::new(events).keep_alive(KeepAlive::default()).into_response()
        }
        Err(err) => {
            counter!(SEND_REQUESTS_TOTAL, "outcome" => err.code()).increment(1);
            gateway_error_response(&err)
        }
    }
}

/// Render a gateway error with its stable status and body shape.
fn gateway_error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": err.code(),
        "detail": err.to_string(),
    });
    if let GatewayError::Unavailable { next_recovery_at } = err {
        body["next_recovery_at"] = json!(next_recovery_at);
    }
    (status, Json(body)).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
