//! End-to-end admin surface tests over real HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use warpflow_auth::{RefreshOutcome, TokenGrant};
use warpflow_core::config::AdminAuthMode;
use warpflow_core::{time, Config, QuotaSnapshot};
use warpflow_dispatch::{
    AccountLocks, AccountSelector, DispatchPolicy, Dispatcher, HealthMonitor, MonitorConfig,
    RefreshCoordinator, RefreshPolicy, SelectorConfig, TokenExchanger,
};
use warpflow_server::{build_router, AppState, ShutdownCoordinator};
use warpflow_store::{AccountStore, CryptoBox};
use warpflow_transport::{JsonEventCodec, TransportConfig, UpstreamTransport};

struct FixedExchanger(RefreshOutcome);

#[async_trait]
impl TokenExchanger for FixedExchanger {
    async fn exchange(&self, _refresh_token: &str) -> RefreshOutcome {
        self.0.clone()
    }

    async fn fetch_quota(&self, _access_token: &str) -> Option<QuotaSnapshot> {
        Some(QuotaSnapshot::from_report(100, 1, false, None, None))
    }
}

fn ok_outcome() -> RefreshOutcome {
    RefreshOutcome::Ok(TokenGrant {
        access_token: "jwt".into(),
        refresh_token: None,
        expires_at: time::future_iso(3600),
    })
}

/// Boot a gateway on an ephemeral port; returns its base URL.
async fn boot(auth_mode: AdminAuthMode, refresh_outcome: RefreshOutcome) -> String {
    let mut config = Config::default();
    config.admin_token = "test-admin".into();
    config.admin_auth_mode = auth_mode;
    let config = Arc::new(config);

    let store = Arc::new(
        AccountStore::open_in_memory(CryptoBox::from_key_bytes(&[9u8; 32])).unwrap(),
    );
    let locks = Arc::new(AccountLocks::new());
    let refresh = Arc::new(RefreshCoordinator::new(
        Arc::clone(&store),
        Arc::new(FixedExchanger(refresh_outcome)),
        RefreshPolicy {
            quota_cooldown_seconds: config.quota_cooldown_seconds,
        },
    ));

    let client = reqwest::Client::new();
    let transport = Arc::new(UpstreamTransport::new(
        client,
        TransportConfig::from_config(&config),
        Arc::new(JsonEventCodec),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        AccountSelector::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            SelectorConfig::default(),
        ),
        (*refresh).clone(),
        transport,
        DispatchPolicy::from_config(&config),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        (*refresh).clone(),
        Arc::clone(&locks),
        MonitorConfig::from_config(&config),
    ));

    let state = AppState {
        store,
        dispatcher,
        refresh,
        locks,
        monitor,
        shutdown: Arc::new(ShutdownCoordinator::new()),
        config,
        metrics_handle: Arc::new(
            metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle(),
        ),
        start_time: Instant::now(),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn get_json(base: &str, path: &str) -> Value {
    client()
        .get(format!("{base}{path}"))
        .bearer_auth("test-admin")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn post_json(base: &str, path: &str, body: Value) -> Value {
    client()
        .post(format!("{base}{path}"))
        .bearer_auth("test-admin")
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn admin_routes_require_the_bearer_token() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;

    let resp = client()
        .get(format!("{base}/admin/api/tokens"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client()
        .get(format!("{base}/admin/api/tokens"))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client()
        .get(format!("{base}/admin/api/tokens"))
        .bearer_auth("test-admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Liveness stays public.
    let resp = client().get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn local_mode_lets_loopback_through() {
    let base = boot(AdminAuthMode::Local, ok_outcome()).await;
    let resp = client()
        .get(format!("{base}/admin/api/tokens"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn import_list_patch_statistics_flow() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;

    // Duplicate tokens in one call dedupe by fingerprint.
    let body = post_json(
        &base,
        "/admin/api/tokens/batch-import",
        json!({ "tokens": ["1//0token-alpha", "1//0token-alpha", "1//0token-beta"] }),
    )
    .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["inserted"], 2);
    assert_eq!(body["data"]["duplicates"], 1);
    assert_eq!(body["data"]["errors"], 0);

    // Listing is masked.
    let body = get_json(&base, "/admin/api/tokens").await;
    let accounts = body["data"].as_array().unwrap();
    assert_eq!(accounts.len(), 2);
    for account in accounts {
        let preview = account["token_preview"].as_str().unwrap();
        assert!(!preview.contains("token-alpha") && !preview.contains("token-beta"));
        assert!(account.get("refresh_token").is_none());
        assert!(account.get("refresh_token_sealed").is_none());
    }
    let first_id = accounts[0]["id"].as_i64().unwrap();

    // Patch to disabled, then verify statistics and readiness see it.
    let resp = client()
        .patch(format!("{base}/admin/api/tokens/{first_id}"))
        .bearer_auth("test-admin")
        .json(&json!({ "status": "disabled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["status"], "disabled");

    let body = get_json(&base, "/admin/api/tokens/statistics").await;
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["by_status"]["disabled"], 1);
    assert_eq!(body["data"]["by_status"]["active"], 1);

    let body = get_json(&base, "/admin/api/tokens/readiness").await;
    assert_eq!(body["data"]["ready"], true);
    assert_eq!(body["data"]["available"], 1);
    assert_eq!(body["data"]["disabled"], 1);

    // The audit trail recorded both mutations.
    let body = get_json(&base, "/admin/api/tokens/events?limit=50").await;
    let actions: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"batch_import"));
    assert!(actions.contains(&"update_account"));
}

#[tokio::test]
async fn invalid_status_patch_is_rejected() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;
    let body = post_json(
        &base,
        "/admin/api/tokens/batch-import",
        json!({ "tokens": ["1//0tok"] }),
    )
    .await;
    let id = body["data"]["rows"][0][1]["id"].as_i64().unwrap();

    let resp = client()
        .patch(format!("{base}/admin/api/tokens/{id}"))
        .bearer_auth("test-admin")
        .json(&json!({ "status": "sleeping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn forced_refresh_applies_the_exchange_outcome() {
    let base = boot(
        AdminAuthMode::Token,
        RefreshOutcome::Rejected {
            code: "invalid_grant".into(),
            message: "INVALID_GRANT".into(),
        },
    )
    .await;
    let body = post_json(
        &base,
        "/admin/api/tokens/batch-import",
        json!({ "tokens": ["1//0tok"] }),
    )
    .await;
    let id = body["data"]["rows"][0][1]["id"].as_i64().unwrap();

    let body = post_json(&base, &format!("/admin/api/tokens/{id}/refresh"), json!({})).await;
    assert_eq!(body["data"]["refreshed"], false);
    assert_eq!(body["data"]["code"], "invalid_grant");
    assert_eq!(body["data"]["account"]["status"], "blocked");
}

#[tokio::test]
async fn refresh_all_hydrates_tokens() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;
    let _ = post_json(
        &base,
        "/admin/api/tokens/batch-import",
        json!({ "accounts": [{ "refresh_token": "1//0tok", "label": "primary" }] }),
    )
    .await;

    let body = post_json(&base, "/admin/api/tokens/refresh-all", json!({})).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["refreshed"], 1);
    assert_eq!(body["data"]["failed"], 0);

    let body = get_json(&base, "/admin/api/tokens").await;
    let account = &body["data"][0];
    assert_eq!(account["label"], "primary");
    assert_eq!(account["quota"]["remaining"], 99);
}

#[tokio::test]
async fn delete_and_batch_delete() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;
    let body = post_json(
        &base,
        "/admin/api/tokens/batch-import",
        json!({ "tokens": ["1//0a", "1//0b", "1//0c"] }),
    )
    .await;
    let ids: Vec<i64> = body["data"]["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row[1]["id"].as_i64().unwrap())
        .collect();

    let resp = client()
        .delete(format!("{base}/admin/api/tokens/{}", ids[0]))
        .bearer_auth("test-admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = post_json(
        &base,
        "/admin/api/tokens/batch-delete",
        json!({ "ids": [ids[1], ids[2], 9999] }),
    )
    .await;
    assert_eq!(body["data"]["deleted"], 2);
    assert_eq!(body["data"]["missing"], 1);

    let body = get_json(&base, "/admin/api/tokens").await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn health_route_reports_monitor_state() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;
    let body = get_json(&base, "/admin/api/tokens/health").await;
    assert_eq!(body["data"]["monitor"]["running"], false);
    assert!(body["data"]["snapshots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn send_rejects_empty_body_and_reports_empty_pool() {
    let base = boot(AdminAuthMode::Token, ok_outcome()).await;

    let resp = client()
        .post(format!("{base}/api/send"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client()
        .post(format!("{base}/api/send"))
        .body("opaque-request-bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no_ready_account");
}
