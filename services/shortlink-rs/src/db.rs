//! PostgreSQL-backed URL repository.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::models::{Url, UrlCreate};
use crate::repository::{RepositoryError, UrlRepository};

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    // Advisory lock so only one replica runs DDL when several instances
    // start simultaneously.
    sqlx::query("SELECT pg_advisory_lock(42421117)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS urls (
            id           BIGSERIAL PRIMARY KEY,
            short_code   VARCHAR(10) NOT NULL UNIQUE,
            original_url TEXT NOT NULL,
            click_count  BIGINT NOT NULL DEFAULT 0,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
            expires_at   TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS urls_expires_at_idx ON urls (expires_at) WHERE expires_at IS NOT NULL")
        .execute(pool)
        .await?;

    sqlx::query("SELECT pg_advisory_unlock(42421117)")
        .execute(pool)
        .await?;

    Ok(())
}

#[derive(Debug, FromRow)]
struct UrlRow {
    id: i64,
    short_code: String,
    original_url: String,
    click_count: i64,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<UrlRow> for Url {
    fn from(row: UrlRow) -> Self {
        Self {
            id: row.id.max(0) as u64,
            short_code: row.short_code,
            original_url: row.original_url,
            created_at: row.created_at,
            expires_at: row.expires_at,
            click_count: row.click_count.max(0) as u64,
        }
    }
}

pub struct PgUrlRepository {
    pool: PgPool,
}

impl PgUrlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Races a query against the cancellation handle; a cancelled query is
/// abandoned before its result is observed.
async fn run<T>(
    cancel: &CancellationToken,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, RepositoryError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RepositoryError::Cancelled),
        result = query => result.map_err(into_repo_err),
    }
}

fn into_repo_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        other => RepositoryError::Internal(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl UrlRepository for PgUrlRepository {
    async fn create(&self, url: UrlCreate, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        let query = sqlx::query_as::<_, UrlRow>(
            "INSERT INTO urls (short_code, original_url, expires_at) \
             VALUES ($1, $2, $3) \
             RETURNING id, short_code, original_url, click_count, created_at, expires_at",
        )
        .bind(&url.short_code)
        .bind(&url.original_url)
        .bind(url.expires_at)
        .fetch_one(&self.pool);
        Ok(run(cancel, query).await?.into())
    }

    async fn get_by_short_code(&self, code: &str, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        let query = sqlx::query_as::<_, UrlRow>(
            "SELECT id, short_code, original_url, click_count, created_at, expires_at \
             FROM urls WHERE short_code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool);
        run(cancel, query).await?.map(Url::from).ok_or(RepositoryError::NotFound)
    }

    async fn get_by_id(&self, id: u64, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        let query = sqlx::query_as::<_, UrlRow>(
            "SELECT id, short_code, original_url, click_count, created_at, expires_at \
             FROM urls WHERE id = $1",
        )
        .bind(id as i64)
        .fetch_optional(&self.pool);
        run(cancel, query).await?.map(Url::from).ok_or(RepositoryError::NotFound)
    }

    async fn delete(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        let query = sqlx::query("DELETE FROM urls WHERE short_code = $1")
            .bind(code)
            .execute(&self.pool);
        let result = run(cancel, query).await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn increment_click_count(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        let query = sqlx::query("UPDATE urls SET click_count = click_count + 1 WHERE short_code = $1")
            .bind(code)
            .execute(&self.pool);
        let result = run(cancel, query).await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn batch_increment_click_counts(
        &self,
        deltas: &HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let apply = async {
            let mut tx = self.pool.begin().await?;
            for (code, delta) in deltas {
                sqlx::query("UPDATE urls SET click_count = click_count + $1 WHERE short_code = $2")
                    .bind(*delta as i64)
                    .bind(code)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        };
        run(cancel, apply).await
    }

    async fn delete_expired(&self, cancel: &CancellationToken) -> Result<u64, RepositoryError> {
        let query = sqlx::query("DELETE FROM urls WHERE expires_at IS NOT NULL AND expires_at <= now()")
            .execute(&self.pool);
        Ok(run(cancel, query).await?.rows_affected())
    }

    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError> {
        let query = sqlx::query("SELECT EXISTS(SELECT 1 FROM urls WHERE short_code = $1)")
            .bind(code)
            .fetch_one(&self.pool);
        let row = run(cancel, query).await?;
        row.try_get::<bool, _>(0).map_err(into_repo_err)
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        let query = sqlx::query("SELECT 1").execute(&self.pool);
        run(cancel, query).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_conversion_clamps_negative_counts() {
        let row = UrlRow {
            id: 7,
            short_code: "abc".to_string(),
            original_url: "https://example.com".to_string(),
            click_count: -3,
            created_at: Utc::now(),
            expires_at: None,
        };
        let url = Url::from(row);
        assert_eq!(url.id, 7);
        assert_eq!(url.click_count, 0);
    }
}
