//! Redis cache layer over any URL repository.
//!
//! Reads are fail-open: a cache fault degrades to a storage read, never an
//! error. Values are TTL'd JSON under `url:{code}`; mutations invalidate.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::models::{Url, UrlCreate};
use crate::repository::{RepositoryError, UrlRepository};

pub async fn create_client(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let mgr = ConnectionManager::new(client).await?;
    Ok(mgr)
}

const URL_TTL_SECONDS: u64 = 3600;

pub fn url_cache_key(short_code: &str) -> String {
    format!("url:{short_code}")
}

/// Get a URL from cache. Returns None on miss or error (fail-open).
async fn get_url(conn: &mut ConnectionManager, short_code: &str) -> Option<Url> {
    let key = url_cache_key(short_code);
    let raw: Option<String> = conn.get(&key).await.ok()?;
    let raw = raw?;
    serde_json::from_str(&raw).ok()
}

/// Set a URL in cache with TTL.
async fn set_url(conn: &mut ConnectionManager, url: &Url) -> Result<()> {
    let key = url_cache_key(&url.short_code);
    let value = serde_json::to_string(url)?;
    let _: () = conn.set_ex(&key, value, URL_TTL_SECONDS).await?;
    Ok(())
}

async fn del_url(conn: &mut ConnectionManager, short_code: &str) -> Result<()> {
    let _: () = conn.del(url_cache_key(short_code)).await?;
    Ok(())
}

async fn ping(conn: &mut ConnectionManager) -> Result<()> {
    let _: String = redis::cmd("PING").query_async(conn).await?;
    Ok(())
}

/// Cache-first decorator. The redirect hot path is served from Redis when
/// the entry is warm; misses fall through and repopulate.
pub struct CachedUrlRepository {
    inner: std::sync::Arc<dyn UrlRepository>,
    redis: ConnectionManager,
}

impl CachedUrlRepository {
    pub fn new(inner: std::sync::Arc<dyn UrlRepository>, redis: ConnectionManager) -> Self {
        Self { inner, redis }
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl UrlRepository for CachedUrlRepository {
    async fn create(&self, url: UrlCreate, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        let created = self.inner.create(url, cancel).await?;
        let mut conn = self.conn();
        if let Err(e) = set_url(&mut conn, &created).await {
            tracing::warn!(error = %e, "cache set failed");
        }
        Ok(created)
    }

    async fn get_by_short_code(&self, code: &str, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let mut conn = self.conn();
        if let Some(url) = get_url(&mut conn, code).await {
            metrics::global().cache_hits_total.inc();
            return Ok(url);
        }
        metrics::global().cache_misses_total.inc();

        let url = self.inner.get_by_short_code(code, cancel).await?;
        if let Err(e) = set_url(&mut conn, &url).await {
            tracing::warn!(error = %e, "cache set failed");
        }
        Ok(url)
    }

    async fn get_by_id(&self, id: u64, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        self.inner.get_by_id(id, cancel).await
    }

    async fn delete(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        self.inner.delete(code, cancel).await?;
        let mut conn = self.conn();
        if let Err(e) = del_url(&mut conn, code).await {
            tracing::warn!(error = %e, "cache invalidation failed");
        }
        Ok(())
    }

    async fn increment_click_count(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        self.inner.increment_click_count(code, cancel).await?;
        let mut conn = self.conn();
        if let Err(e) = del_url(&mut conn, code).await {
            tracing::warn!(error = %e, "cache invalidation failed");
        }
        Ok(())
    }

    async fn batch_increment_click_counts(
        &self,
        deltas: &HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        self.inner.batch_increment_click_counts(deltas, cancel).await?;
        // Invalidate so the next read sees fresh counts.
        let mut conn = self.conn();
        for code in deltas.keys() {
            if let Err(e) = del_url(&mut conn, code).await {
                tracing::warn!(error = %e, short_code = %code, "cache invalidation failed");
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, cancel: &CancellationToken) -> Result<u64, RepositoryError> {
        // Swept entries age out of the cache via TTL; the expiry check on
        // the read path covers the gap.
        self.inner.delete_expired(cancel).await
    }

    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let mut conn = self.conn();
        if get_url(&mut conn, code).await.is_some() {
            return Ok(true);
        }
        self.inner.exists(code, cancel).await
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        self.inner.health_check(cancel).await?;
        let mut conn = self.conn();
        ping(&mut conn)
            .await
            .map_err(RepositoryError::Internal)
    }
}
