mod aggregator;
mod base62;
mod cache;
mod config;
mod db;
mod enums;
mod errors;
mod handlers;
mod idgen;
mod metrics;
mod middleware;
mod models;
mod ratelimit;
mod repository;
mod sanitizer;
mod service;
mod state;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::aggregator::{AggregatorConfig, ClickAggregator, RepositoryFlusher};
use crate::config::IdGenStrategy;
use crate::idgen::{CodeGenerator, CollisionAwareGenerator, RandomGenerator, RepositoryExistence, SnowflakeGenerator};
use crate::ratelimit::{RateLimitConfig, SlidingWindowLimiter};
use crate::repository::UrlRepository;
use crate::sanitizer::{SanitizerConfig, UrlSanitizer};
use crate::service::{AnalyticsService, RedirectService, UrlService};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::from_env()?;

    // Tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    tracing::info!(env = %config.app_env, "starting shortlink-rs");

    // Prometheus
    let registry = Registry::new();
    let app_metrics = metrics::init(&registry);

    // Durable storage: PostgreSQL, or the in-memory store for local runs
    // with DATABASE_URL=memory.
    let durable: Arc<dyn UrlRepository> = if config.database_url == "memory" {
        tracing::warn!("using the in-memory repository, data will not survive a restart");
        Arc::new(repository::MemoryUrlRepository::new())
    } else {
        let pool = db::create_pool(&config.database_url).await?;
        db::migrate(&pool).await?;
        tracing::info!("database ready");
        Arc::new(db::PgUrlRepository::new(pool))
    };

    // Cache layer when Redis is configured.
    let repo: Arc<dyn UrlRepository> = match &config.redis_url {
        Some(url) => {
            let conn = cache::create_client(url).await?;
            tracing::info!("redis ready");
            Arc::new(cache::CachedUrlRepository::new(durable, conn))
        }
        None => {
            tracing::info!("no REDIS_URL configured, serving reads from storage");
            durable
        }
    };

    // Identifier generation
    let base_generator: Arc<dyn CodeGenerator> = match config.idgen_strategy {
        IdGenStrategy::Random => Arc::new(RandomGenerator::new(config.short_code_len)),
        IdGenStrategy::Snowflake => {
            Arc::new(SnowflakeGenerator::new(config.idgen_node_id, config.short_code_len)?)
        }
    };
    let generator = Arc::new(CollisionAwareGenerator::new(
        base_generator,
        Arc::new(RepositoryExistence(Arc::clone(&repo))),
        config.idgen_max_retries,
    ));
    let generator_stats = Arc::clone(&generator);

    // Click aggregation
    let aggregator = Arc::new(ClickAggregator::new(
        AggregatorConfig {
            flush_interval: config.click_flush_interval,
            batch_size: config.click_batch_size,
            channel_buffer: config.click_channel_buffer,
        },
        Arc::new(RepositoryFlusher::new(Arc::clone(&repo))),
    ));

    // Rate limiting
    let limiter = config.rate_limit_enabled.then(|| {
        Arc::new(SlidingWindowLimiter::new(RateLimitConfig {
            requests: config.rate_limit_requests,
            window: config.rate_limit_window,
        }))
    });

    // Services
    let sanitizer = UrlSanitizer::new(SanitizerConfig {
        max_url_length: config.max_url_length,
        allow_private_ips: config.allow_private_ips,
        blocked_hosts: config.blocked_hosts.clone(),
    });
    let urls = UrlService::new(
        Arc::clone(&repo),
        generator,
        sanitizer,
        config.base_url.clone(),
    );
    let redirects = RedirectService::new(Arc::clone(&repo), Some(Arc::clone(&aggregator)));
    let analytics = AnalyticsService::new(Arc::clone(&repo), Some(Arc::clone(&aggregator)));

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        config,
        Arc::clone(&repo),
        urls,
        redirects,
        analytics,
        limiter,
        aggregator,
        app_metrics,
        registry,
        shutdown.clone(),
    );

    // Background expiry sweep
    let sweeper = spawn_expiry_sweeper(
        Arc::clone(&repo),
        state.config.expiry_sweep_interval,
        shutdown.clone(),
    );

    // Router + server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = handlers::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
    .await?;

    // Ordered teardown: in-flight requests have drained, now close the
    // limiter, flush the aggregator one last time, and join the sweeper.
    if let Some(limiter) = &state.limiter {
        limiter.close().await;
    }
    state.aggregator.stop().await;
    shutdown.cancel();
    sweeper.await.ok();

    let stats = generator_stats.stats();
    tracing::info!(
        generations = stats.total_generations,
        retries = stats.total_retries,
        collisions = stats.total_collisions,
        clicks_dropped = state.aggregator.dropped_count(),
        "shutdown complete"
    );

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives, marks the process not-ready, and
/// arms a grace-window timer that force-cancels lingering work.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    state.ready.store(false, Ordering::SeqCst);

    let token = state.shutdown.clone();
    let grace = state.config.shutdown_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        token.cancel();
    });
}

/// Periodically removes expired URLs (the bulk half of the URL lifecycle).
fn spawn_expiry_sweeper(
    repo: Arc<dyn UrlRepository>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    match repo.delete_expired(&token).await {
                        Ok(0) => {}
                        Ok(swept) => {
                            metrics::global().urls_swept_total.inc_by(swept);
                            tracing::info!(swept, "expired urls removed");
                        }
                        Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                    }
                }
            }
        }
    })
}
