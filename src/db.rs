pub mod objects;
pub mod records;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

pub use objects::PgWorkflowStore;
pub use records::PgRecordIndex;

/// Create a database pool from configuration
/// Note: sqlx pools are internally reference-counted, so clones share the
/// same underlying connections
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let database_url = config
        .url
        .as_deref()
        .context("HOLDINGPEN_DATABASE__URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_pool_initialization() {
        let pool = test_support::pool().await;
        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, 1);
    }

    #[tokio::test]
    async fn test_missing_url_is_reported() {
        let config = DatabaseConfig {
            url: None,
            ..Default::default()
        };
        let err = create_pool(&config).await.unwrap_err();
        assert!(err.to_string().contains("HOLDINGPEN_DATABASE__URL"));
    }
}
