//! Wizpix API Server
//!
//! Serves authentication, credit consumption, checkout and payment webhook
//! endpoints on top of PostgreSQL.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wizpix_api::{auth::PemFileKeyProvider, create_router, tasks, AppState, Config};
use wizpix_billing::BillingService;
use wizpix_shared::{create_pool, run_migrations, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // LOG_FORMAT=json for machine-readable output
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wizpix_api=debug,wizpix_billing=debug".into()),
        )
        .with(json_logs.then(|| fmt::layer().json()))
        .with((!json_logs).then(fmt::layer))
        .init();

    tracing::info!("Starting Wizpix API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(app_env = ?config.app_env, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let billing = BillingService::from_env(
        store.clone(),
        config.enable_billing,
        config.quota_enforcement,
        &config.frontend_url,
    )?;
    if !config.enable_billing {
        tracing::warn!("Billing disabled - checkout requests will be refused");
    }

    let keys = Arc::new(PemFileKeyProvider::new(
        config.jwt_private_key_path.clone(),
        config.jwt_public_key_path.clone(),
    ));
    let state = AppState::new(store, config.clone(), keys, billing.clone());

    let stale_after = time::Duration::minutes(config.checkout_stale_after_minutes);
    tokio::spawn(tasks::maintenance_task(billing, stale_after));
    tracing::info!("Checkout maintenance task started");

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
