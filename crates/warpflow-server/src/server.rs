//! Router assembly and the serve loop.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin;
use crate::auth::admin_guard;
use crate::metrics;
use crate::send;
use crate::state::AppState;

/// Generates UUIDv7 request IDs.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let admin_routes = admin::router()
        .layer(from_fn_with_state(state.clone(), admin_guard));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/send", post(send::send))
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics_handle)
}

/// Bind and serve until the shutdown coordinator fires, then drain
/// background tasks.
pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    let token = shutdown.token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;

    shutdown
        .graceful_shutdown(Some(Duration::from_secs(30)))
        .await;
    Ok(())
}
