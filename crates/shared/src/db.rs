//! Connection pool and migrations

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::error::StoreResult;

/// Create the application pool
pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Apply pending migrations from the workspace `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
