pub mod schema;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Builds one bounded connection pool. The server calls this twice with
/// different caps: one pool for the entity service and metric queries, one
/// owned exclusively by the metrics writer, so bulk ingestion cannot starve
/// API reads.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("failed to connect to the database")
}
