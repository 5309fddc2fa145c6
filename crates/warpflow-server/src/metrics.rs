//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// Admin API requests total (counter, labels: route).
pub const ADMIN_REQUESTS_TOTAL: &str = "admin_requests_total";
/// Admin authorization rejections total (counter).
pub const ADMIN_AUTH_REJECTED_TOTAL: &str = "admin_auth_rejected_total";
/// Accounts imported total (counter).
pub const ACCOUNTS_IMPORTED_TOTAL: &str = "accounts_imported_total";
/// Forced refreshes total (counter, labels: outcome).
pub const ADMIN_REFRESH_TOTAL: &str = "admin_refresh_total";
/// Raw send requests total (counter, labels: outcome).
pub const SEND_REQUESTS_TOTAL: &str = "send_requests_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_names_are_prometheus_safe() {
        for name in [
            ADMIN_REQUESTS_TOTAL,
            ADMIN_AUTH_REJECTED_TOTAL,
            ACCOUNTS_IMPORTED_TOTAL,
            ADMIN_REFRESH_TOTAL,
            SEND_REQUESTS_TOTAL,
        ] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
