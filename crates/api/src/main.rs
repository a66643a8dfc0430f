//! IdeaKit API Server
//!
//! Serves the credit ledger, checkout, kit creation and Stripe webhook
//! endpoints on top of the billing engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use ideakit_api::{create_router, AppState, Config};
use ideakit_billing::{BillingService, PricingConfig, Stores};
use ideakit_shared::{create_migration_pool, create_pool, run_migrations};
use sqlx::PgPool;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting IdeaKit API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_pool = create_migration_pool(&config.database_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        tracing::info!("Database migrations complete");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let billing = Arc::new(build_billing(&config, pool)?);
    let state = AppState::new(config.clone(), billing);

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
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .expose_headers([header::CONTENT_TYPE])
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

/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ideakit_api=debug,ideakit_billing=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Ledger and kit creation always run against Postgres; Stripe is optional
fn build_billing(config: &Config, pool: PgPool) -> anyhow::Result<BillingService> {
    if config.enable_billing {
        match BillingService::from_env(pool.clone()) {
            Ok(service) => {
                tracing::info!("Stripe billing service initialized");
                return Ok(service);
            }
            Err(e) => {
                tracing::warn!("Stripe billing not configured: {}", e);
            }
        }
    } else {
        tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
    }

    tracing::warn!("Checkout and webhook routes will answer 503");
    Ok(
        BillingService::new(Stores::postgres(pool.clone()), PricingConfig::from_env()?)
            .with_invariants(pool),
    )
}
