//! Business services over the repository and generator contracts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ClickAggregator;
use crate::errors::ServiceError;
use crate::idgen::CodeGenerator;
use crate::metrics;
use crate::models::{ShortenResponse, Url, UrlCreate, UrlStats};
use crate::repository::UrlRepository;
use crate::sanitizer::UrlSanitizer;

#[derive(Debug)]
pub struct CreateUrlRequest {
    pub original_url: String,
    pub expires_in: Option<Duration>,
}

// ── URL service ───────────────────────────────────────────────────────────────

pub struct UrlService {
    repo: Arc<dyn UrlRepository>,
    generator: Arc<dyn CodeGenerator>,
    sanitizer: UrlSanitizer,
    base_url: String,
}

impl UrlService {
    pub fn new(
        repo: Arc<dyn UrlRepository>,
        generator: Arc<dyn CodeGenerator>,
        sanitizer: UrlSanitizer,
        base_url: String,
    ) -> Self {
        Self {
            repo,
            generator,
            sanitizer,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn create(
        &self,
        request: CreateUrlRequest,
        cancel: &CancellationToken,
    ) -> Result<ShortenResponse, ServiceError> {
        let original_url = self.sanitizer.sanitize(&request.original_url)?;
        let short_code = self.generator.generate(cancel).await?;
        let expires_at = match request.expires_in {
            Some(d) => Some(
                Utc::now()
                    + chrono::Duration::from_std(d)
                        .map_err(|_| ServiceError::InvalidExpiresIn("duration out of range".to_string()))?,
            ),
            None => None,
        };

        let create = UrlCreate {
            short_code,
            original_url,
            expires_at,
        };
        create.validate()?;

        let url = self.repo.create(create, cancel).await?;
        metrics::global().urls_created_total.inc();
        Ok(ShortenResponse {
            short_url: format!("{}/{}", self.base_url, url.short_code),
            short_code: url.short_code,
            original_url: url.original_url,
            created_at: url.created_at,
            expires_at: url.expires_at,
        })
    }

    pub async fn get(&self, short_code: &str, cancel: &CancellationToken) -> Result<Url, ServiceError> {
        let url = self.repo.get_by_short_code(short_code, cancel).await?;
        if url.is_expired(Utc::now()) {
            return Err(ServiceError::Expired);
        }
        Ok(url)
    }

    pub async fn delete(&self, short_code: &str, cancel: &CancellationToken) -> Result<(), ServiceError> {
        self.repo.delete(short_code, cancel).await?;
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// ── Redirect service ──────────────────────────────────────────────────────────

/// Outcome of a redirect resolution.
///
/// `permanent` is always `false`: a 302 keeps intermediaries from caching
/// the hop, which would swallow click counts.
#[derive(Debug, Clone)]
pub struct RedirectResult {
    pub original_url: String,
    pub permanent: bool,
    pub cache_hit: bool,
}

pub struct RedirectService {
    repo: Arc<dyn UrlRepository>,
    aggregator: Option<Arc<ClickAggregator>>,
}

impl RedirectService {
    pub fn new(repo: Arc<dyn UrlRepository>, aggregator: Option<Arc<ClickAggregator>>) -> Self {
        Self { repo, aggregator }
    }

    /// Resolves a short code. Click recording never blocks and never fails
    /// the redirect; an expired URL surfaces before any click is counted.
    pub async fn redirect(
        &self,
        short_code: &str,
        cancel: &CancellationToken,
    ) -> Result<RedirectResult, ServiceError> {
        let url = self.repo.get_by_short_code(short_code, cancel).await?;
        if url.is_expired(Utc::now()) {
            return Err(ServiceError::Expired);
        }

        match &self.aggregator {
            Some(aggregator) => aggregator.record_click(&url.short_code),
            None => {
                if let Err(e) = self.repo.increment_click_count(short_code, cancel).await {
                    tracing::debug!(error = %e, short_code, "click increment failed");
                }
            }
        }

        Ok(RedirectResult {
            original_url: url.original_url,
            permanent: false,
            cache_hit: false,
        })
    }
}

// ── Analytics service ─────────────────────────────────────────────────────────

pub struct AnalyticsService {
    repo: Arc<dyn UrlRepository>,
    pending: Option<Arc<ClickAggregator>>,
}

impl AnalyticsService {
    pub fn new(repo: Arc<dyn UrlRepository>, pending: Option<Arc<ClickAggregator>>) -> Self {
        Self { repo, pending }
    }

    /// Durable click count, overlaid with the aggregator's in-flight count
    /// when one is wired.
    pub async fn get_url_stats(
        &self,
        short_code: &str,
        cancel: &CancellationToken,
    ) -> Result<UrlStats, ServiceError> {
        let url = self.repo.get_by_short_code(short_code, cancel).await?;
        let pending_count = self
            .pending
            .as_ref()
            .map(|aggregator| aggregator.get_pending_stats().get(short_code).copied().unwrap_or(0));
        Ok(UrlStats {
            short_code: url.short_code,
            click_count: url.click_count,
            pending_count,
        })
    }
}
