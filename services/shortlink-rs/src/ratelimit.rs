//! Sliding-window rate limiter.
//!
//! Per-identifier timestamp logs inside a sharded map; the DashMap entry
//! lock is the per-identifier critical section, so unrelated identifiers
//! never contend. A background reaper prunes expired timestamps every
//! window and drops identifiers whose logs become empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window: Duration,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i32,
    /// Time until the oldest counted request leaves the window.
    pub reset_after: Duration,
    /// Zero when admitted; equals `reset_after` when denied.
    pub retry_after: Duration,
    pub limit: u32,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit check cancelled")]
    Cancelled,
}

pub struct SlidingWindowLimiter {
    requests: u32,
    window: Duration,
    entries: Arc<DashMap<String, VecDeque<Instant>>>,
    reaper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        // A zero window would spin the reaper; clamp to one second.
        let window = if config.window.is_zero() {
            Duration::from_secs(1)
        } else {
            config.window
        };
        let entries: Arc<DashMap<String, VecDeque<Instant>>> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let reaper = tokio::spawn(reap_loop(Arc::clone(&entries), window, shutdown.clone()));
        Self {
            requests: config.requests,
            window,
            entries,
            reaper: tokio::sync::Mutex::new(Some(reaper)),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Admission check for one identifier. Prunes expired timestamps, then
    /// either appends `now` or denies with the time until a slot frees up.
    pub fn allow(&self, identifier: &str, cancel: &CancellationToken) -> Result<Decision, RateLimitError> {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }
        let now = Instant::now();
        let mut entry = self.entries.entry(identifier.to_string()).or_default();
        let log = entry.value_mut();
        prune(log, now, self.window);

        if log.len() as u32 >= self.requests {
            let reset_after = log
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(Duration::ZERO);
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset_after,
                retry_after: reset_after,
                limit: self.requests,
            });
        }

        let reset_after = log
            .front()
            .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(Duration::ZERO);
        log.push_back(now);
        Ok(Decision {
            allowed: true,
            remaining: self.requests as i32 - log.len() as i32,
            reset_after,
            retry_after: Duration::ZERO,
            limit: self.requests,
        })
    }

    /// Erases the identifier's entire request log.
    pub fn reset(&self, identifier: &str, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }
        self.entries.remove(identifier);
        Ok(())
    }

    /// Number of identifiers currently tracked.
    pub fn tracked_identifiers(&self) -> usize {
        self.entries.len()
    }

    /// Signals the reaper, waits for it, and releases resources. Safe to
    /// call more than once.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
        }
        if let Some(handle) = self.reaper.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = log.front() {
        if now.duration_since(front) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

async fn reap_loop(
    entries: Arc<DashMap<String, VecDeque<Instant>>>,
    window: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(window);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let now = Instant::now();
                entries.retain(|_, log| {
                    prune(log, now, window);
                    !log.is_empty()
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig { requests, window })
    }

    #[tokio::test]
    async fn admits_up_to_capacity_then_denies() {
        let limiter = limiter(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.allow("ip:1.2.3.4", &cancel).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.retry_after, Duration::ZERO);
        }

        let denied = limiter.allow("ip:1.2.3.4", &cancel).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
        assert!(denied.retry_after > Duration::ZERO);
        assert_eq!(denied.retry_after, denied.reset_after);
        limiter.close().await;
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(limiter.allow("ip:a", &cancel).unwrap().allowed);
        assert!(limiter.allow("ip:b", &cancel).unwrap().allowed);
        assert!(!limiter.allow("ip:a", &cancel).unwrap().allowed);
        limiter.close().await;
    }

    #[tokio::test]
    async fn first_admit_reports_zero_reset() {
        let limiter = limiter(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let decision = limiter.allow("ip:fresh", &cancel).unwrap();
        assert_eq!(decision.reset_after, Duration::ZERO);
        limiter.close().await;
    }

    #[tokio::test]
    async fn slots_free_up_after_the_window() {
        let limiter = limiter(2, Duration::from_millis(80));
        let cancel = CancellationToken::new();
        assert!(limiter.allow("ip:x", &cancel).unwrap().allowed);
        assert!(limiter.allow("ip:x", &cancel).unwrap().allowed);
        assert!(!limiter.allow("ip:x", &cancel).unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("ip:x", &cancel).unwrap().allowed);
        limiter.close().await;
    }

    #[tokio::test]
    async fn reset_erases_the_entry() {
        let limiter = limiter(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(limiter.allow("ip:x", &cancel).unwrap().allowed);
        assert!(!limiter.allow("ip:x", &cancel).unwrap().allowed);
        limiter.reset("ip:x", &cancel).unwrap();
        assert!(limiter.allow("ip:x", &cancel).unwrap().allowed);
        limiter.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_checks_admit_exactly_the_capacity() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.allow("ip:contended", &cancel).unwrap().allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        limiter.close().await;
    }

    #[tokio::test]
    async fn reaper_drops_idle_identifiers() {
        let limiter = limiter(5, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        limiter.allow("ip:x", &cancel).unwrap();
        assert_eq!(limiter.tracked_identifiers(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.tracked_identifiers(), 0);
        limiter.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter.close().await;
        limiter.close().await;
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let limiter = limiter(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            limiter.allow("ip:x", &cancel),
            Err(RateLimitError::Cancelled)
        ));
        assert!(matches!(limiter.reset("ip:x", &cancel), Err(RateLimitError::Cancelled)));
        limiter.close().await;
    }
}
