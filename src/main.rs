use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use optscan::cache::HomeCache;
use optscan::config::Config;
use optscan::limiter::RateLimiter;
use optscan::orchestrator::Orchestrator;
use optscan::pipeline::RefreshPipeline;
use optscan::provider::http::HttpMarketProvider;
use optscan::reports::ReportStore;
use optscan::server::{self, AppState};
use optscan::universe::SymbolUniverse;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();

    let provider = Arc::new(
        HttpMarketProvider::from_env()
            .context("MARKET_API_URL must point at the market-data aggregator")?,
    );

    let limiter = Arc::new(RateLimiter::new(config.rate.clone()));
    let universe = Arc::new(SymbolUniverse::open(
        &config.data_root.join("universe.db"),
    )?);
    let reports = Arc::new(ReportStore::new(&config.data_root)?);
    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        limiter.clone(),
        universe.clone(),
    ));
    let cache = Arc::new(HomeCache::new(
        provider.clone(),
        limiter.clone(),
        orchestrator.clone(),
        config.refresh_interval,
    ));
    let pipeline = Arc::new(RefreshPipeline::new(
        provider.clone(),
        limiter.clone(),
        cache.clone(),
        orchestrator.clone(),
    ));

    let state = AppState {
        provider: provider.clone(),
        analyzer: provider,
        limiter,
        universe,
        reports,
        cache,
        orchestrator,
        pipeline,
        generate_timeout: config.generate_timeout,
    };

    let app = server::router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting optscan HTTP server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
