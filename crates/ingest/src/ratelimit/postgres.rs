//! PostgreSQL counter store
//!
//! Events live in `ingest_rate_limit_events`, indexed by `(limit_key, recorded_at)`,
//! so every worker process sharing the database sees the same budgets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::error;

use super::counter::{CounterStats, CounterStore, CounterStoreError};

/// Durable counter store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> CounterStoreError {
    error!("Rate limit counter query failed: {}", e);
    CounterStoreError::Database(e.to_string())
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn count_since(&self, key: &str, since: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM ingest_rate_limit_events
            WHERE limit_key = $1 AND recorded_at >= $2
            "#,
        )
        .bind(key)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("count").max(0) as u64)
    }

    async fn oldest_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CounterStoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(recorded_at) AS oldest
            FROM ingest_rate_limit_events
            WHERE limit_key = $1 AND recorded_at >= $2
            "#,
        )
        .bind(key)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("oldest"))
    }

    async fn record(&self, key: &str, at: DateTime<Utc>) -> Result<(), CounterStoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_rate_limit_events (limit_key, recorded_at)
            VALUES ($1, $2)
            "#,
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM ingest_rate_limit_events WHERE recorded_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CounterStats, CounterStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT limit_key) AS keys, COUNT(*) AS events
            FROM ingest_rate_limit_events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(CounterStats {
            keys: row.get::<i64, _>("keys").max(0) as u64,
            events: row.get::<i64, _>("events").max(0) as u64,
        })
    }
}
