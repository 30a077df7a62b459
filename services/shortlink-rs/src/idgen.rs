//! Short-code identifier generation.
//!
//! Two base strategies — random (CSPRNG) and Snowflake — behind one
//! [`CodeGenerator`] contract, plus a collision-aware wrapper that probes a
//! storage existence check and retries a bounded number of times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::base62;
use crate::repository::{RepositoryError, UrlRepository};

/// Code length used when a configured length is below 1.
pub const DEFAULT_CODE_LENGTH: usize = 7;

/// Snowflake epoch: 2024-01-01T00:00:00Z in milliseconds.
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_704_067_200_000;

pub const MAX_NODE_ID: u16 = 1023;

const SEQUENCE_MASK: u16 = 0xFFF;
const TIMESTAMP_SHIFT: u32 = 22;
const NODE_SHIFT: u32 = 12;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("node id {0} out of range 0..={MAX_NODE_ID}")]
    InvalidNodeId(u64),
    #[error("clock moved backwards: last generation at {last_ms}ms, now {now_ms}ms")]
    ClockMovedBackwards { last_ms: i64, now_ms: i64 },
    #[error("no unused code after {0} attempts")]
    MaxRetriesExceeded(u32),
    #[error("generation cancelled")]
    Cancelled,
    #[error("rng failure: {0}")]
    Rng(#[from] rand::Error),
    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, cancel: &CancellationToken) -> Result<String, GeneratorError>;
}

/// Storage probe used by the collision-aware wrapper.
#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError>;
}

/// Adapts any [`UrlRepository`] to the existence probe.
pub struct RepositoryExistence(pub Arc<dyn UrlRepository>);

#[async_trait]
impl ExistenceChecker for RepositoryExistence {
    async fn exists(&self, code: &str, cancel: &CancellationToken) -> Result<bool, RepositoryError> {
        self.0.exists(code, cancel).await
    }
}

// ── Random ────────────────────────────────────────────────────────────────────

/// Fixed-length codes with every character drawn independently and uniformly
/// from the Base62 alphabet, using the operating system CSPRNG.
pub struct RandomGenerator {
    length: usize,
}

impl RandomGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            length: if length < 1 { DEFAULT_CODE_LENGTH } else { length },
        }
    }

    fn random_code(&self) -> Result<String, GeneratorError> {
        let mut code = String::with_capacity(self.length);
        let mut buf = [0u8; 32];
        'outer: while code.len() < self.length {
            OsRng.try_fill_bytes(&mut buf)?;
            for &byte in &buf {
                // Rejection sampling: 248 is the largest multiple of 62 that
                // fits in a byte, so `byte % 62` stays uniform.
                if byte < 248 {
                    code.push(base62::ALPHABET[(byte % 62) as usize] as char);
                    if code.len() == self.length {
                        break 'outer;
                    }
                }
            }
        }
        Ok(code)
    }
}

#[async_trait]
impl CodeGenerator for RandomGenerator {
    async fn generate(&self, cancel: &CancellationToken) -> Result<String, GeneratorError> {
        if cancel.is_cancelled() {
            return Err(GeneratorError::Cancelled);
        }
        self.random_code()
    }
}

// ── Snowflake ─────────────────────────────────────────────────────────────────

struct SnowflakeState {
    last_ms: i64,
    sequence: u16,
}

/// 63-bit ids laid out as `timestamp:41 | node:10 | sequence:12`, encoded to
/// Base62 with zero-padding up to `min_length`.
pub struct SnowflakeGenerator {
    node_id: u16,
    min_length: usize,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16, min_length: usize) -> Result<Self, GeneratorError> {
        if node_id > MAX_NODE_ID {
            return Err(GeneratorError::InvalidNodeId(node_id as u64));
        }
        Ok(Self {
            node_id,
            min_length: if min_length < 1 { DEFAULT_CODE_LENGTH } else { min_length },
            state: Mutex::new(SnowflakeState { last_ms: 0, sequence: 0 }),
        })
    }

    /// Produce the next raw id. One short critical section; a saturated
    /// sequence spins until the wall clock reaches the next millisecond.
    pub fn next_id(&self) -> Result<u64, GeneratorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now_ms = Utc::now().timestamp_millis();
        if now_ms < state.last_ms {
            return Err(GeneratorError::ClockMovedBackwards {
                last_ms: state.last_ms,
                now_ms,
            });
        }
        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now_ms <= state.last_ms {
                    std::hint::spin_loop();
                    now_ms = Utc::now().timestamp_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now_ms;

        let elapsed = (now_ms - SNOWFLAKE_EPOCH_MS) as u64;
        Ok((elapsed << TIMESTAMP_SHIFT) | ((self.node_id as u64) << NODE_SHIFT) | state.sequence as u64)
    }
}

#[async_trait]
impl CodeGenerator for SnowflakeGenerator {
    async fn generate(&self, cancel: &CancellationToken) -> Result<String, GeneratorError> {
        if cancel.is_cancelled() {
            return Err(GeneratorError::Cancelled);
        }
        Ok(base62::encode_padded(self.next_id()?, self.min_length))
    }
}

// ── Collision-aware wrapper ───────────────────────────────────────────────────

/// Snapshot of the wrapper's atomically maintained counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorStats {
    pub total_generations: u64,
    pub total_retries: u64,
    pub total_collisions: u64,
}

/// Wraps a base generator with an existence probe and bounded retry. Base
/// generator and probe failures surface immediately; only collisions retry.
pub struct CollisionAwareGenerator {
    inner: Arc<dyn CodeGenerator>,
    checker: Arc<dyn ExistenceChecker>,
    max_retries: u32,
    total_generations: AtomicU64,
    total_retries: AtomicU64,
    total_collisions: AtomicU64,
}

impl CollisionAwareGenerator {
    pub fn new(inner: Arc<dyn CodeGenerator>, checker: Arc<dyn ExistenceChecker>, max_retries: i32) -> Self {
        Self {
            inner,
            checker,
            max_retries: max_retries.max(0) as u32,
            total_generations: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            total_collisions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            total_generations: self.total_generations.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_collisions: self.total_collisions.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.total_generations.store(0, Ordering::Relaxed);
        self.total_retries.store(0, Ordering::Relaxed);
        self.total_collisions.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl CodeGenerator for CollisionAwareGenerator {
    async fn generate(&self, cancel: &CancellationToken) -> Result<String, GeneratorError> {
        self.total_generations.fetch_add(1, Ordering::Relaxed);
        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(GeneratorError::Cancelled);
            }
            if attempt > 0 {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
            }
            let code = self.inner.generate(cancel).await?;
            if !self.checker.exists(&code, cancel).await? {
                return Ok(code);
            }
            self.total_collisions.fetch_add(1, Ordering::Relaxed);
        }
        Err(GeneratorError::MaxRetriesExceeded(self.max_retries + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;

    struct SeqGenerator {
        codes: Mutex<VecDeque<&'static str>>,
    }

    impl SeqGenerator {
        fn new(codes: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                codes: Mutex::new(codes.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl CodeGenerator for SeqGenerator {
        async fn generate(&self, _cancel: &CancellationToken) -> Result<String, GeneratorError> {
            let mut codes = self.codes.lock().unwrap();
            codes
                .pop_front()
                .map(str::to_string)
                .ok_or(GeneratorError::MaxRetriesExceeded(0))
        }
    }

    struct SetChecker {
        existing: HashSet<&'static str>,
        probes: AtomicUsize,
        fail: bool,
    }

    impl SetChecker {
        fn new(existing: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                existing: existing.iter().copied().collect(),
                probes: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                existing: HashSet::new(),
                probes: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl ExistenceChecker for SetChecker {
        async fn exists(&self, code: &str, _cancel: &CancellationToken) -> Result<bool, RepositoryError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RepositoryError::Internal(anyhow::anyhow!("probe down")));
            }
            Ok(self.existing.contains(code))
        }
    }

    #[tokio::test]
    async fn random_codes_have_the_configured_length_and_charset() {
        let generator = RandomGenerator::new(9);
        let cancel = CancellationToken::new();
        let code = generator.generate(&cancel).await.unwrap();
        assert_eq!(code.len(), 9);
        assert!(base62::is_valid(&code));
    }

    #[tokio::test]
    async fn random_length_below_one_coerces_to_default() {
        let generator = RandomGenerator::new(0);
        let cancel = CancellationToken::new();
        let code = generator.generate(&cancel).await.unwrap();
        assert_eq!(code.len(), DEFAULT_CODE_LENGTH);
    }

    #[tokio::test]
    async fn random_codes_differ_between_calls() {
        let generator = RandomGenerator::new(12);
        let cancel = CancellationToken::new();
        let a = generator.generate(&cancel).await.unwrap();
        let b = generator.generate(&cancel).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn snowflake_rejects_out_of_range_node_id() {
        assert!(matches!(
            SnowflakeGenerator::new(1024, 7),
            Err(GeneratorError::InvalidNodeId(1024))
        ));
        assert!(SnowflakeGenerator::new(MAX_NODE_ID, 7).is_ok());
    }

    #[test]
    fn snowflake_ids_are_strictly_increasing() {
        let generator = SnowflakeGenerator::new(3, 7).unwrap();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id().unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn snowflake_id_embeds_the_node() {
        let generator = SnowflakeGenerator::new(42, 7).unwrap();
        let id = generator.next_id().unwrap();
        assert_eq!((id >> NODE_SHIFT) & 0x3FF, 42);
    }

    #[tokio::test]
    async fn snowflake_codes_meet_the_minimum_length() {
        let generator = SnowflakeGenerator::new(0, 11).unwrap();
        let cancel = CancellationToken::new();
        let code = generator.generate(&cancel).await.unwrap();
        assert!(code.len() >= 11);
        assert!(base62::is_valid(&code));
    }

    #[tokio::test]
    async fn collision_wrapper_returns_first_unused_code() {
        let wrapper = CollisionAwareGenerator::new(
            SeqGenerator::new(&["taken1", "taken2", "free"]),
            SetChecker::new(&["taken1", "taken2"]),
            3,
        );
        let cancel = CancellationToken::new();
        assert_eq!(wrapper.generate(&cancel).await.unwrap(), "free");
        let stats = wrapper.stats();
        assert_eq!(stats.total_generations, 1);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.total_collisions, 2);
    }

    #[tokio::test]
    async fn collision_wrapper_gives_up_after_max_retries() {
        let wrapper = CollisionAwareGenerator::new(
            SeqGenerator::new(&["a", "b", "c"]),
            SetChecker::new(&["a", "b", "c"]),
            2,
        );
        let cancel = CancellationToken::new();
        assert!(matches!(
            wrapper.generate(&cancel).await,
            Err(GeneratorError::MaxRetriesExceeded(3))
        ));
        assert_eq!(wrapper.stats().total_collisions, 3);
    }

    #[tokio::test]
    async fn negative_max_retries_coerces_to_zero() {
        let wrapper = CollisionAwareGenerator::new(
            SeqGenerator::new(&["a", "b"]),
            SetChecker::new(&["a", "b"]),
            -5,
        );
        let cancel = CancellationToken::new();
        assert!(matches!(
            wrapper.generate(&cancel).await,
            Err(GeneratorError::MaxRetriesExceeded(1))
        ));
    }

    #[tokio::test]
    async fn checker_failure_surfaces_without_retry() {
        let checker = SetChecker::failing();
        let wrapper = CollisionAwareGenerator::new(
            SeqGenerator::new(&["a", "b", "c"]),
            Arc::clone(&checker) as Arc<dyn ExistenceChecker>,
            5,
        );
        let cancel = CancellationToken::new();
        assert!(matches!(
            wrapper.generate(&cancel).await,
            Err(GeneratorError::Storage(_))
        ));
        assert_eq!(checker.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_honored_before_any_attempt() {
        let wrapper = CollisionAwareGenerator::new(
            SeqGenerator::new(&["a"]),
            SetChecker::new(&[]),
            3,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            wrapper.generate(&cancel).await,
            Err(GeneratorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn stats_reset_to_zero() {
        let wrapper = CollisionAwareGenerator::new(SeqGenerator::new(&["x"]), SetChecker::new(&[]), 0);
        let cancel = CancellationToken::new();
        wrapper.generate(&cancel).await.unwrap();
        wrapper.reset_stats();
        assert_eq!(
            wrapper.stats(),
            GeneratorStats { total_generations: 0, total_retries: 0, total_collisions: 0 }
        );
    }
}
