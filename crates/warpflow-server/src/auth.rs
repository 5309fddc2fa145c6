//! Admin authorization gate.
//!
//! Bearer token (or `x-admin-token`) compared in constant time against
//! the configured admin token. Mode `local` lets loopback peers through
//! without a token; mode `off` disables the check entirely (development).

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::counter;
use serde_json::json;

use warpflow_core::config::AdminAuthMode;

use crate::metrics::ADMIN_AUTH_REJECTED_TOTAL;
use crate::state::AppState;

/// Compare two secrets without a timing side channel.
///
/// Length mismatch returns early; the length of the configured token is
/// not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Pull the presented admin credential out of the headers.
fn presented_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let text = value.to_str().ok()?.trim();
        if let Some(prefix) = text.get(..7) {
            if prefix.eq_ignore_ascii_case("bearer ") {
                let token = text.get(7..)?.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    if let Some(value) = headers.get("x-admin-token") {
        let token = value.to_str().ok()?.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Axum middleware guarding the admin routes.
pub async fn admin_guard(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match check(&state, &peer, request.headers()) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            counter!(ADMIN_AUTH_REJECTED_TOTAL).increment(1);
            rejection
        }
    }
}

fn check(state: &AppState, peer: &SocketAddr, headers: &HeaderMap) -> Result<(), Response> {
    match state.config.admin_auth_mode {
        AdminAuthMode::Off => return Ok(()),
        AdminAuthMode::Local if is_loopback(peer) => return Ok(()),
        AdminAuthMode::Local | AdminAuthMode::Token => {}
    }

    let expected = state.config.admin_token.as_bytes();
    if expected.is_empty() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "detail": "ADMIN_TOKEN is not configured (or set ADMIN_AUTH_MODE=local/off)",
            })),
        )
            .into_response());
    }

    let presented = presented_token(headers).unwrap_or_default();
    if constant_time_eq(presented.as_bytes(), expected) {
        return Ok(());
    }

    Err((
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", "Bearer")],
        Json(json!({ "success": false, "detail": "invalid admin token" })),
    )
        .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
