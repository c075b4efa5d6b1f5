use anyhow::Context;
use cloudbid_auction::AuctionService;
use cloudbid_ledger::{create_pg_market_store, CreditLedger, InMemoryMarketStore, MarketStore};
use cloudbid_market::{
    app::{create_app, AppState},
    auth::JwtConfig,
    config::MarketConfig,
    metrics::{setup_metrics_recorder, spawn_metrics_exporter},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "cloudbid_market=debug,cloudbid_auction=debug,tower_http=debug".into()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MarketConfig::load().context("failed to load configuration")?;

    if let Some(addr) = config.metrics_addr {
        let handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
        spawn_metrics_exporter(handle, addr);
    }

    let store: Arc<dyn MarketStore> = if config.uses_database() {
        let store = create_pg_market_store(&config.database_url, config.db_max_connections)
            .await
            .context("failed to open market database")?;
        Arc::new(store)
    } else {
        tracing::warn!("no database_url configured, running on the in-memory store");
        Arc::new(InMemoryMarketStore::new())
    };

    let ledger = CreditLedger::new(store, config.settlement_policy);
    let auction = AuctionService::new(ledger, config.timings());
    auction
        .bootstrap()
        .await
        .context("failed to resume auctions")?;

    let state = AppState::new(
        auction.clone(),
        JwtConfig::new(config.jwt_secret.clone(), config.token_ttl_secs),
    );
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        policy = ?config.settlement_policy,
        "cloudbid market listening"
    );

    // Coordinators stop before the server drains so open streams can finish.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                return;
            }
            tracing::info!("shutdown signal received");
            auction.shutdown().await;
        })
        .await?;

    Ok(())
}
