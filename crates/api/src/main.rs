//! Revisume API Server
//!
//! Serves authentication, metered feature gates, credit balances and the
//! Stripe billing endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use revisume_api::{create_router, AppState, Config, StoreBackend};
use revisume_billing::{
    CreditEngine, CreditStore, MemoryCreditStore, PgCreditStore, SystemClock, TierPolicy,
};
use revisume_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,revisume_api=debug,revisume_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Revisume API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(store = ?config.credit_store, "Configuration loaded");

    let store = build_store(&config).await?;
    let policy = TierPolicy::from_env();
    let engine = CreditEngine::new(store, policy, Arc::new(SystemClock));

    let state = AppState::new(engine, config.clone());

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn CreditStore>> {
    match config.credit_store {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory credit store; balances are lost on restart");
            Ok(Arc::new(MemoryCreditStore::new()))
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            tracing::info!("Database connection established");

            if config.run_migrations {
                tracing::info!("Running database migrations...");
                run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");
            }

            Ok(Arc::new(PgCreditStore::new(pool)))
        }
    }
}
