use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ClickAggregator;
use crate::config::Config;
use crate::metrics::AppMetrics;
use crate::ratelimit::SlidingWindowLimiter;
use crate::repository::UrlRepository;
use crate::service::{AnalyticsService, RedirectService, UrlService};

/// Shared application state injected into every handler via the axum State
/// extractor.
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn UrlRepository>,
    pub urls: UrlService,
    pub redirects: RedirectService,
    pub analytics: AnalyticsService,
    pub limiter: Option<Arc<SlidingWindowLimiter>>,
    pub aggregator: Arc<ClickAggregator>,
    pub metrics: &'static AppMetrics,
    pub registry: Registry,
    /// Flipped to false when shutdown begins; `/ready` reports it.
    pub ready: AtomicBool,
    /// Server-level cancellation handle, borrowed by per-request work.
    pub shutdown: CancellationToken,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        repo: Arc<dyn UrlRepository>,
        urls: UrlService,
        redirects: RedirectService,
        analytics: AnalyticsService,
        limiter: Option<Arc<SlidingWindowLimiter>>,
        aggregator: Arc<ClickAggregator>,
        metrics: &'static AppMetrics,
        registry: Registry,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            repo,
            urls,
            redirects,
            analytics,
            limiter,
            aggregator,
            metrics,
            registry,
            ready: AtomicBool::new(true),
            shutdown,
        })
    }
}
