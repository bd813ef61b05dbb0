use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tacplane::accounting::{AuditStore, MemoryAuditStore};
use tacplane::accounting::postgres::PostgresAuditStore;
use tacplane::config::CoordinatorConfig;
use tacplane::identity::ZitadelProvider;
use tacplane::Coordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;
    fmt().with_env_filter(filter).init();

    let config = CoordinatorConfig::from_env();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "tacplane",
        "tacplane starting: RUST_LOG='{}', session_timeout={}s, cache_ttl={}s, cleanup_interval={}s, provider_timeout={}s, zitadel={}, database={}",
        rust_log,
        config.session_timeout_secs,
        config.credential_cache_ttl_secs,
        config.cleanup_interval_secs,
        config.provider_timeout_secs,
        config.zitadel.as_ref().map(|z| z.url.as_str()).unwrap_or("<unset>"),
        if config.database_url.is_some() { "configured" } else { "<unset>" },
    );

    let zitadel = config
        .zitadel
        .clone()
        .context("identity provider not configured: set TACPLANE_ZITADEL_URL, TACPLANE_ZITADEL_CLIENT_ID and TACPLANE_ZITADEL_CLIENT_SECRET")?;
    let provider = Arc::new(ZitadelProvider::new(zitadel, config.provider_timeout()).context("failed to build identity provider")?);

    let store: Arc<dyn AuditStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PostgresAuditStore::connect(url).await?),
        None => {
            warn!(target: "tacplane", "TACPLANE_DATABASE_URL not set; audit trail is kept in memory only");
            Arc::new(MemoryAuditStore::new())
        }
    };

    let coordinator = Coordinator::start(config, provider, store);
    info!(target: "tacplane", "ready; waiting for shutdown signal");
    wait_for_shutdown().await?;
    info!(target: "tacplane", "shutdown signal received");
    coordinator.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl-C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")
}
