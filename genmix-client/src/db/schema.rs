use std::time::Duration;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// DDL for the `generation` table and the `pipeline_run_history` ledger.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

/// Create tables and indexes if they do not exist yet.
pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await.map(|_| ())
}

/// Single-connection in-memory database with the schema applied.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is
/// pinned to exactly one connection that is never recycled.
pub async fn in_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect("sqlite::memory:")
        .await?;
    apply(&pool).await?;
    Ok(pool)
}
