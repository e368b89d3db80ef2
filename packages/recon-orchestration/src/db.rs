//! SQLite connection setup shared by the durable stores

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Idempotent DDL for orchestration tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS reconstructions (
    id TEXT PRIMARY KEY NOT NULL,
    image_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_results (
    job_id TEXT PRIMARY KEY NOT NULL,
    reconstruction_id TEXT NOT NULL,
    step TEXT NOT NULL,
    status TEXT NOT NULL,
    outcome TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_results_reconstruction ON job_results (reconstruction_id);
";

/// Open a pool and make sure the schema exists.
///
/// `sqlite::memory:` databases live per connection, so the pool is pinned to a
/// single connection for them.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let in_memory = database_url.contains(":memory:");
    let pool_options = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .acquire_timeout(Duration::from_secs(5));
    let pool_options = if in_memory {
        // Closing the only connection drops the database
        pool_options.idle_timeout(None).max_lifetime(None)
    } else {
        pool_options
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
    };
    let pool = pool_options.connect_with(options).await?;

    init_schema(&pool).await?;
    info!("Connected to {} (schema ready)", database_url);

    Ok(pool)
}

/// Initialize database schema
async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in CREATE_TABLES
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
