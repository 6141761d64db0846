//! Atomic token consumption against a bucket backend.

use rand::Rng;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{BackendError, BucketBackend, BucketKey, SubjectKey};
use super::bucket::BucketState;
use super::clock::{Clock, SystemClock};
use super::rules::RateRule;
use crate::error::{RateLimiterError, Result};

/// Default number of read-modify-write attempts per consumption.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 32;

/// Retry and timeout policy for a [`TokenBucketStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Attempts before reporting the store unavailable. At least one is always made.
    pub max_attempts: u32,
    /// Base delay between attempts, grown linearly with jitter. Zero only yields.
    pub retry_backoff: Duration,
    /// Limit on each individual backend call.
    pub operation_timeout: Option<Duration>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::ZERO,
            operation_timeout: None,
        }
    }
}

/// Why a single attempt did not produce a decision.
enum AttemptFailure {
    Conflict,
    Backend(BackendError),
}

/// Token buckets kept in a shared backend, updated with compare-and-set.
///
/// For any one (subject, rule index), concurrent consumptions behave as if they
/// ran one after another: every update is based on the value it replaces, and a
/// lost race is retried from a fresh read.
pub struct TokenBucketStore<K: SubjectKey, B: BucketBackend<K>> {
    backend: B,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
    _subject: PhantomData<fn() -> K>,
}

impl<K: SubjectKey, B: BucketBackend<K>> TokenBucketStore<K, B> {
    /// Create a store on the system clock with default settings.
    pub fn new(backend: B) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            settings: StoreSettings::default(),
            _subject: PhantomData,
        }
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Try to take `tokens` from the bucket for `(subject, rule_index)`.
    ///
    /// The bucket is created full from `rule` on first use. Returns whether the
    /// tokens were granted; a refusal leaves the balance untouched apart from
    /// refill. Fails with [`RateLimiterError::StoreUnavailable`] once the retry
    /// budget is spent, or at once on a timeout or unreadable record.
    pub async fn try_consume(
        &self,
        subject: &K,
        rule_index: usize,
        rule: &RateRule,
        tokens: u64,
    ) -> Result<bool> {
        let key = BucketKey::new(subject.clone(), rule_index);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(&key, rule, tokens).await {
                Ok(allowed) => {
                    trace!(
                        key = %key,
                        attempt = attempt,
                        tokens = tokens,
                        allowed = allowed,
                        "Bucket updated"
                    );
                    return Ok(allowed);
                }
                Err(AttemptFailure::Conflict) => {
                    trace!(key = %key, attempt = attempt, "Lost compare-and-set race, retrying");
                    last_failure = "compare-and-set contention".to_string();
                }
                Err(AttemptFailure::Backend(e)) if e.is_transient() => {
                    debug!(key = %key, attempt = attempt, error = %e, "Bucket backend error, retrying");
                    last_failure = e.to_string();
                }
                Err(AttemptFailure::Backend(e)) => {
                    warn!(key = %key, attempt = attempt, error = %e, "Bucket backend failed");
                    return Err(unavailable(&key, attempt, e.to_string()));
                }
            }

            if attempt < max_attempts {
                self.backoff(attempt).await;
            }
        }

        warn!(
            key = %key,
            attempts = max_attempts,
            reason = %last_failure,
            "Giving up on bucket update"
        );
        Err(unavailable(&key, max_attempts, last_failure))
    }

    /// One read-compute-write cycle. `Conflict` means another writer won.
    async fn attempt(
        &self,
        key: &BucketKey<K>,
        rule: &RateRule,
        tokens: u64,
    ) -> std::result::Result<bool, AttemptFailure> {
        let current = self
            .timed(self.backend.get(key))
            .await
            .map_err(AttemptFailure::Backend)?;

        let now = self.clock.now();
        let base = current.unwrap_or_else(|| BucketState::full(rule, now));
        let (next, allowed) = base.consume(rule, tokens, now);

        let swapped = self
            .timed(self.backend.compare_and_set(key, current.as_ref(), &next))
            .await
            .map_err(AttemptFailure::Backend)?;

        if swapped {
            Ok(allowed)
        } else {
            Err(AttemptFailure::Conflict)
        }
    }

    async fn timed<T>(
        &self,
        operation: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> std::result::Result<T, BackendError> {
        match self.settings.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| BackendError::Timeout(limit))?,
            None => operation.await,
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.settings.retry_backoff;
        if base.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        let jitter_nanos = rand::thread_rng().gen_range(0..=base.as_nanos() as u64);
        let delay = base.saturating_mul(attempt) + Duration::from_nanos(jitter_nanos);
        tokio::time::sleep(delay).await;
    }
}

fn unavailable<K: SubjectKey>(key: &BucketKey<K>, attempts: u32, reason: String) -> RateLimiterError {
    RateLimiterError::StoreUnavailable {
        key: key.to_string(),
        attempts,
        reason,
    }
}
