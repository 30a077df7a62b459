use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub struct AppMetrics {
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub clicks_recorded_total: IntCounter,
    pub clicks_flushed_total: IntCounter,
    pub clicks_dropped_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub urls_created_total: IntCounter,
    pub urls_swept_total: IntCounter,
}

static METRICS: OnceLock<AppMetrics> = OnceLock::new();

/// Registers the process-wide metrics into `registry`. Call once at startup,
/// before anything touches [`global`].
pub fn init(registry: &Registry) -> &'static AppMetrics {
    METRICS.get_or_init(|| build(registry))
}

/// The process-wide metrics. Falls back to an unregistered set when `init`
/// was never called (library tests).
pub fn global() -> &'static AppMetrics {
    METRICS.get_or_init(|| build(&Registry::new()))
}

fn build(registry: &Registry) -> AppMetrics {
    let http_requests = IntCounterVec::new(
        Opts::new("http_requests_total", "HTTP requests by handler and status"),
        &["handler", "method", "status_code"],
    )
    .unwrap();
    let http_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency by handler",
        ),
        &["handler"],
    )
    .unwrap();
    let cache_hits = IntCounter::with_opts(Opts::new(
        "shortlink_cache_hits_total",
        "Redirect lookups served from cache",
    ))
    .unwrap();
    let cache_misses = IntCounter::with_opts(Opts::new(
        "shortlink_cache_misses_total",
        "Redirect lookups that fell through to storage",
    ))
    .unwrap();
    let clicks_recorded = IntCounter::with_opts(Opts::new(
        "shortlink_clicks_recorded_total",
        "Clicks accepted by the aggregator",
    ))
    .unwrap();
    let clicks_flushed = IntCounter::with_opts(Opts::new(
        "shortlink_clicks_flushed_total",
        "Clicks delivered to the durable store",
    ))
    .unwrap();
    let clicks_dropped = IntCounter::with_opts(Opts::new(
        "shortlink_clicks_dropped_total",
        "Clicks dropped at aggregator channel saturation",
    ))
    .unwrap();
    let rate_limited = IntCounter::with_opts(Opts::new(
        "shortlink_rate_limited_total",
        "Requests denied by the rate limiter",
    ))
    .unwrap();
    let urls_created = IntCounter::with_opts(Opts::new(
        "shortlink_urls_created_total",
        "Short URLs created",
    ))
    .unwrap();
    let urls_swept = IntCounter::with_opts(Opts::new(
        "shortlink_urls_swept_total",
        "Expired URLs removed by the background sweep",
    ))
    .unwrap();

    registry.register(Box::new(http_requests.clone())).ok();
    registry.register(Box::new(http_duration.clone())).ok();
    registry.register(Box::new(cache_hits.clone())).ok();
    registry.register(Box::new(cache_misses.clone())).ok();
    registry.register(Box::new(clicks_recorded.clone())).ok();
    registry.register(Box::new(clicks_flushed.clone())).ok();
    registry.register(Box::new(clicks_dropped.clone())).ok();
    registry.register(Box::new(rate_limited.clone())).ok();
    registry.register(Box::new(urls_created.clone())).ok();
    registry.register(Box::new(urls_swept.clone())).ok();

    AppMetrics {
        http_requests_total: http_requests,
        http_request_duration_seconds: http_duration,
        cache_hits_total: cache_hits,
        cache_misses_total: cache_misses,
        clicks_recorded_total: clicks_recorded,
        clicks_flushed_total: clicks_flushed,
        clicks_dropped_total: clicks_dropped,
        rate_limited_total: rate_limited,
        urls_created_total: urls_created,
        urls_swept_total: urls_swept,
    }
}

pub fn gather(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}
