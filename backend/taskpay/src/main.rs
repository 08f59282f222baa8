//! TaskPay service entry point.
//!
//! Connects to SQLite, wires the payment gateway into the session manager and
//! serves the client API. Payment polls and task tickers run as background
//! tasks owned by each user session.

use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskpay::api::{self, ApiState};
use taskpay::catalog::Catalog;
use taskpay::config::Config;
use taskpay::db;
use taskpay::gateway::HttpGateway;
use taskpay::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // RUST_LOG controls verbosity.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let pool = db::init_pool(&config.database_url).await?;

    let gateway = Arc::new(HttpGateway::new(
        &config.gateway_url,
        config.gateway_api_key.clone(),
        Duration::from_secs(config.gateway_timeout_secs),
    )?);
    info!("Payment gateway: {}", config.gateway_url);

    let sessions = SessionManager::new(pool, gateway, config.policy.clone(), Catalog::builtin());
    let app = api::router(Arc::new(ApiState { sessions }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
