//! TokenPool - Prediction Market Token Settlement Service
//!
//! Resolves markets, distributes token payouts, and keeps per-user
//! balances consistent with the transaction history.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenpool_backend::api::{create_router, AppState};
use tokenpool_backend::ledger::BalanceLedger;
use tokenpool_backend::markets::MarketStore;
use tokenpool_backend::models::Config;
use tokenpool_backend::reconcile::BalanceReconciler;
use tokenpool_backend::resolution::{ResolutionLogStore, ResolutionOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("🚀 TokenPool Settlement Service Starting");
    info!("💾 Database: {}", config.database_path);

    let ledger = Arc::new(BalanceLedger::new(&config.database_path)?);
    let markets = Arc::new(MarketStore::new(&config.database_path)?);
    let log = Arc::new(ResolutionLogStore::new(&config.database_path)?);

    let orchestrator = Arc::new(ResolutionOrchestrator::new(
        markets.clone(),
        ledger.clone(),
        log.clone(),
        config.payout_fanout,
    ));
    let reconciler = Arc::new(BalanceReconciler::new(ledger.clone(), markets.clone()));

    let state = AppState {
        orchestrator,
        ledger,
        log,
        reconciler,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter overrides
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenpool_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
