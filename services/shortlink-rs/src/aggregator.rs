//! Asynchronous click-count aggregation.
//!
//! The redirect hot path calls [`ClickAggregator::record_click`], which is
//! wait-free: an atomic stopped-check plus a bounded-channel `try_send`. A
//! background consumer folds events into a pending counter map and flushes
//! it to the durable [`ClickFlusher`] on a timer tick or when the map
//! reaches `batch_size` distinct codes. Saturation drops events and counts
//! them; it never back-pressures the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::repository::UrlRepository;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub channel_buffer: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            batch_size: 100,
            channel_buffer: 10_000,
        }
    }
}

/// Durable sink for drained click batches.
#[async_trait]
pub trait ClickFlusher: Send + Sync {
    async fn flush_clicks(&self, counts: HashMap<String, u64>) -> anyhow::Result<()>;
}

/// Flushes batches into a [`UrlRepository`] via `batch_increment_click_counts`.
pub struct RepositoryFlusher {
    repo: Arc<dyn UrlRepository>,
    // Never cancelled: the final drain must complete during shutdown.
    cancel: CancellationToken,
}

impl RepositoryFlusher {
    pub fn new(repo: Arc<dyn UrlRepository>) -> Self {
        Self {
            repo,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ClickFlusher for RepositoryFlusher {
    async fn flush_clicks(&self, counts: HashMap<String, u64>) -> anyhow::Result<()> {
        self.repo
            .batch_increment_click_counts(&counts, &self.cancel)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

pub struct ClickAggregator {
    tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<String, u64>>>,
    dropped: Arc<AtomicU64>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClickAggregator {
    pub fn new(config: AggregatorConfig, flusher: Arc<dyn ClickFlusher>) -> Self {
        let defaults = AggregatorConfig::default();
        let flush_interval = if config.flush_interval.is_zero() {
            defaults.flush_interval
        } else {
            config.flush_interval
        };
        let batch_size = config.batch_size.max(1);
        let channel_buffer = config.channel_buffer.max(1);

        let (tx, rx) = mpsc::channel(channel_buffer);
        let pending: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(consume_loop(
            rx,
            Arc::clone(&pending),
            flusher,
            flush_interval,
            batch_size,
            shutdown.clone(),
        ));

        Self {
            tx,
            pending,
            dropped,
            stopped: AtomicBool::new(false),
            shutdown,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Records one click. Wait-free for the caller; a saturated channel
    /// drops the event and counts it. Calls after `stop` are ignored.
    pub fn record_click(&self, short_code: &str) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        metrics::global().clicks_recorded_total.inc();
        if self.tx.try_send(short_code.to_string()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::global().clicks_dropped_total.inc();
        }
    }

    /// Snapshot of counts accumulated but not yet flushed.
    pub fn get_pending_stats(&self) -> HashMap<String, u64> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events dropped at channel saturation since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting events, drains the channel, performs one final
    /// flush, and joins the consumer. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn accumulate(pending: &Mutex<HashMap<String, u64>>, short_code: String) -> usize {
    let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
    *map.entry(short_code).or_insert(0) += 1;
    map.len()
}

async fn consume_loop(
    mut rx: mpsc::Receiver<String>,
    pending: Arc<Mutex<HashMap<String, u64>>>,
    flusher: Arc<dyn ClickFlusher>,
    flush_interval: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(code) => {
                    if accumulate(&pending, code) >= batch_size {
                        flush_pending(&pending, flusher.as_ref()).await;
                    }
                }
                None => break,
            },
            _ = tick.tick() => flush_pending(&pending, flusher.as_ref()).await,
            _ = shutdown.cancelled() => {
                while let Ok(code) = rx.try_recv() {
                    accumulate(&pending, code);
                }
                break;
            }
        }
    }

    flush_pending(&pending, flusher.as_ref()).await;
}

/// Atomic swap of the live map for an empty one, then handoff. A failed
/// flush logs and drops the batch (at-most-once, bounded loss).
async fn flush_pending(pending: &Mutex<HashMap<String, u64>>, flusher: &dyn ClickFlusher) {
    let drained = {
        let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
        if map.is_empty() {
            return;
        }
        std::mem::take(&mut *map)
    };
    let distinct = drained.len();
    let total: u64 = drained.values().sum();
    match flusher.flush_clicks(drained).await {
        Ok(()) => {
            metrics::global().clicks_flushed_total.inc_by(total);
            tracing::debug!(distinct, total, "flushed click batch");
        }
        Err(e) => tracing::warn!(error = %e, distinct, total, "click flush failed, batch dropped"),
    }
}
