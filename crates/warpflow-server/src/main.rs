//! # warpflow
//!
//! Gateway server binary — wires together the store, refresher,
//! transport, dispatcher, and health monitor, then serves HTTP.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warpflow_auth::{QuotaProbe, Refresher, RefresherConfig};
use warpflow_core::Config;
use warpflow_dispatch::{
    AccountLocks, AccountSelector, DispatchPolicy, Dispatcher, HealthMonitor, IdentityExchanger,
    MonitorConfig, RefreshCoordinator, RefreshPolicy, SelectorConfig,
};
use warpflow_server::{serve, shutdown_signal, AppState, ShutdownCoordinator};
use warpflow_store::{AccountStore, ConnectionConfig, CryptoBox};
use warpflow_transport::{JsonEventCodec, TransportConfig, UpstreamTransport};

/// Warp-upstream gateway server.
#[derive(Parser, Debug)]
#[command(name = "warpflow", about = "Multi-account gateway for the Warp upstream")]
struct Cli {
    /// Host to bind (overrides HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database (overrides TOKEN_DB_PATH).
    #[arg(long)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    let config = Arc::new(config);

    let metrics_handle = Arc::new(warpflow_server::metrics::install_recorder());

    // Key derivation is machine-bound through the admin token + db path;
    // production deployments must set TOKEN_ENCRYPTION_KEY explicitly.
    let seed = format!("{}|{}", config.admin_token, config.db_path);
    let crypto = CryptoBox::from_config(config.encryption_key.as_deref(), &seed);
    if crypto.is_derived() {
        warn!("refresh-token encryption key is derived; set TOKEN_ENCRYPTION_KEY in production");
    }

    let store = Arc::new(
        AccountStore::open_file(&config.db_path, &ConnectionConfig::default(), crypto)
            .with_context(|| format!("failed to open account store at {}", config.db_path))?,
    );
    info!(db_path = %config.db_path, "account store ready");

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.upstream_connect_timeout_seconds))
        .build()
        .context("failed to build HTTP client")?;

    let exchanger = Arc::new(IdentityExchanger::new(
        Refresher::new(client.clone(), RefresherConfig::from_config(&config)),
        QuotaProbe::new(client.clone(), &config),
    ));
    let refresh = Arc::new(RefreshCoordinator::new(
        Arc::clone(&store),
        exchanger,
        RefreshPolicy {
            quota_cooldown_seconds: config.quota_cooldown_seconds,
        },
    ));

    let locks = Arc::new(AccountLocks::new());
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
            SelectorConfig {
                health_fail_threshold: i64::from(config.health_fail_threshold),
                lock_wait: Duration::from_secs(5),
            },
        ),
        (*refresh).clone(),
        transport,
        DispatchPolicy::from_config(&config),
    ));

    let shutdown = Arc::new(ShutdownCoordinator::new());

    // The monitor starts after the store and stops before the process
    // exits; its lifetime is bound to the shutdown coordinator.
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        (*refresh).clone(),
        Arc::clone(&locks),
        MonitorConfig::from_config(&config),
    ));
    {
        let monitor = Arc::clone(&monitor);
        let token = shutdown.token();
        shutdown.register_task(tokio::spawn(async move {
            monitor.run(token).await;
        }));
    }

    let state = AppState {
        store,
        dispatcher,
        refresh,
        locks,
        monitor,
        shutdown: Arc::clone(&shutdown),
        config: Arc::clone(&config),
        metrics_handle,
        start_time: Instant::now(),
    };

    {
        let shutdown = Arc::clone(&shutdown);
        let _ = tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.shutdown();
        });
    }

    serve(state, &config.bind_address()).await
}
