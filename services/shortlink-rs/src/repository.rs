//! URL persistence contract.
//!
//! The core components only see this trait; PostgreSQL (`db`) and the Redis
//! cache decorator (`cache`) implement it, and `MemoryUrlRepository` backs
//! the test suites and cache-less local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{Url, UrlCreate};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("short url not found")]
    NotFound,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait UrlRepository: Send + Sync {
    async fn create(&self, url: UrlCreate, cancel: &CancellationToken) -> Result<Url, RepositoryError>;

    async fn get_by_short_code(&self, code: &str, cancel: &CancellationToken) -> Result<Url, RepositoryError>;

    async fn get_by_id(&self, id: u64, cancel: &CancellationToken) -> Result<Url, RepositoryError>;

    async fn delete(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError>;

    async fn increment_click_count(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError>;

    /// Applies a batch of click deltas. Codes deleted since the clicks were
    /// recorded are skipped, not errors.
    async fn batch_increment_click_counts(
        &self,
        deltas: &HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError>;

    /// Removes every URL whose expiry has passed; returns how many went.
    async fn delete_expired(&self, cancel: &CancellationToken) -> Result<u64, RepositoryError>;

    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError>;

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), RepositoryError>;
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), RepositoryError> {
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }
    Ok(())
}

// ── In-memory implementation ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUrlRepository {
    urls: Mutex<HashMap<String, Url>>,
    next_id: AtomicU64,
}

impl MemoryUrlRepository {
    pub fn new() -> Self {
        Self {
            urls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Url>> {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UrlRepository for MemoryUrlRepository {
    async fn create(&self, url: UrlCreate, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        ensure_live(cancel)?;
        let mut urls = self.lock();
        if urls.contains_key(&url.short_code) {
            return Err(RepositoryError::Internal(anyhow::anyhow!(
                "short code already exists: {}",
                url.short_code
            )));
        }
        let stored = Url {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            short_code: url.short_code.clone(),
            original_url: url.original_url,
            created_at: Utc::now(),
            expires_at: url.expires_at,
            click_count: 0,
        };
        urls.insert(url.short_code, stored.clone());
        Ok(stored)
    }

    async fn get_by_short_code(&self, code: &str, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        ensure_live(cancel)?;
        self.lock().get(code).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn get_by_id(&self, id: u64, cancel: &CancellationToken) -> Result<Url, RepositoryError> {
        ensure_live(cancel)?;
        self.lock()
            .values()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn delete(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        self.lock().remove(code).map(|_| ()).ok_or(RepositoryError::NotFound)
    }

    async fn increment_click_count(&self, code: &str, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        let mut urls = self.lock();
        let url = urls.get_mut(code).ok_or(RepositoryError::NotFound)?;
        url.click_count += 1;
        Ok(())
    }

    async fn batch_increment_click_counts(
        &self,
        deltas: &HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        let mut urls = self.lock();
        for (code, delta) in deltas {
            if let Some(url) = urls.get_mut(code) {
                url.click_count += delta;
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, cancel: &CancellationToken) -> Result<u64, RepositoryError> {
        ensure_live(cancel)?;
        let now = Utc::now();
        let mut urls = self.lock();
        let before = urls.len();
        urls.retain(|_, u| !u.is_expired(now));
        Ok((before - urls.len()) as u64)
    }

    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError> {
        ensure_live(cancel)?;
        Ok(self.lock().contains_key(code))
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        Ok(())
    }
}
