//! Token bucket state and the refill-on-access algorithm.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::RateRule;

/// Snapshot of one (subject, rule) bucket.
///
/// Tokens accrue continuously at `capacity / period` and saturate at capacity.
/// Nothing mutates a bucket in place: [`BucketState::consume`] returns the next
/// state and the store writes it back with compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens available as of `last_refill`
    pub available_tokens: f64,
    /// When `available_tokens` was last brought up to date
    pub last_refill: DateTime<Utc>,
}

impl BucketState {
    /// A full bucket for `rule`, as created on first access.
    pub fn full(rule: &RateRule, now: DateTime<Utc>) -> Self {
        Self {
            available_tokens: rule.capacity() as f64,
            last_refill: now,
        }
    }

    /// Tokens available at `now`, capped at the rule's capacity.
    ///
    /// A `now` earlier than `last_refill` adds nothing.
    pub fn replenished(&self, rule: &RateRule, now: DateTime<Utc>) -> f64 {
        let capacity = rule.capacity() as f64;
        let elapsed = now - self.last_refill;

        let refill = match elapsed.num_nanoseconds() {
            Some(nanos) if nanos <= 0 => 0.0,
            Some(nanos) => (nanos as f64 * capacity) / rule.period().as_nanos() as f64,
            // Hundreds of years idle
            None if elapsed > chrono::Duration::zero() => capacity,
            None => 0.0,
        };

        (self.available_tokens + refill).min(capacity)
    }

    /// Attempt to take `tokens` from the bucket at `now`.
    ///
    /// Returns the state to write back and whether the tokens were granted. A
    /// refused attempt still records the refill but deducts nothing.
    pub fn consume(&self, rule: &RateRule, tokens: u64, now: DateTime<Utc>) -> (Self, bool) {
        let replenished = self.replenished(rule, now);
        let requested = tokens as f64;
        let last_refill = now.max(self.last_refill);

        if replenished >= requested {
            (
                Self {
                    available_tokens: replenished - requested,
                    last_refill,
                },
                true,
            )
        } else {
            (
                Self {
                    available_tokens: replenished,
                    last_refill,
                },
                false,
            )
        }
    }

    /// Encode for storage in a backend that holds opaque records.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a record previously produced by [`BucketState::encode`].
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn rule(capacity: u64, period: Duration) -> RateRule {
        RateRule::new(capacity, period).unwrap()
    }

    #[test]
    fn test_new_bucket_is_full() {
        let rule = rule(10, Duration::from_secs(1));
        let state = BucketState::full(&rule, t0());

        assert_eq!(state.available_tokens, 10.0);
        assert_eq!(state.last_refill, t0());
    }

    #[test]
    fn test_capacity_consumptions_then_refusal() {
        let rule = rule(5, Duration::from_secs(1));
        let mut state = BucketState::full(&rule, t0());

        for _ in 0..5 {
            let (next, allowed) = state.consume(&rule, 1, t0());
            assert!(allowed);
            state = next;
        }

        let (next, allowed) = state.consume(&rule, 1, t0());
        assert!(!allowed);
        assert_eq!(next.available_tokens, 0.0);
    }

    #[test]
    fn test_refusal_does_not_deduct() {
        let rule = rule(3, Duration::from_secs(3));
        let state = BucketState {
            available_tokens: 0.5,
            last_refill: t0(),
        };

        let (next, allowed) = state.consume(&rule, 1, t0());
        assert!(!allowed);
        assert_eq!(next.available_tokens, 0.5);
    }

    #[test]
    fn test_one_token_refills_after_period_over_capacity() {
        let rule = rule(10, Duration::from_secs(1));
        let empty = BucketState {
            available_tokens: 0.0,
            last_refill: t0(),
        };

        let (_, allowed) = empty.consume(&rule, 1, t0() + chrono::Duration::milliseconds(99));
        assert!(!allowed);

        let (next, allowed) = empty.consume(&rule, 1, t0() + chrono::Duration::milliseconds(100));
        assert!(allowed);
        assert_eq!(next.available_tokens, 0.0);
    }

    #[test]
    fn test_refill_saturates_at_capacity() {
        let rule = rule(4, Duration::from_secs(1));
        let state = BucketState {
            available_tokens: 1.0,
            last_refill: t0(),
        };

        let later = t0() + chrono::Duration::days(30);
        assert_eq!(state.replenished(&rule, later), 4.0);

        let (next, allowed) = state.consume(&rule, 1, later);
        assert!(allowed);
        assert_eq!(next.available_tokens, 3.0);
        assert_eq!(next.last_refill, later);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let rule = rule(4, Duration::from_secs(1));
        let state = BucketState {
            available_tokens: 1.0,
            last_refill: t0(),
        };

        let earlier = t0() - chrono::Duration::seconds(10);
        let (next, allowed) = state.consume(&rule, 1, earlier);
        assert!(allowed);
        assert_eq!(next.available_tokens, 0.0);
        assert_eq!(next.last_refill, t0());
    }

    #[test]
    fn test_multi_token_consumption() {
        let rule = rule(10, Duration::from_secs(1));
        let state = BucketState::full(&rule, t0());

        let (next, allowed) = state.consume(&rule, 7, t0());
        assert!(allowed);
        assert_eq!(next.available_tokens, 3.0);

        let (_, allowed) = next.consume(&rule, 4, t0());
        assert!(!allowed);

        let (_, allowed) = state.consume(&rule, 11, t0());
        assert!(!allowed);
    }

    #[test]
    fn test_encoding_preserves_state_exactly() {
        let state = BucketState {
            available_tokens: 2.0 / 3.0,
            last_refill: t0() + chrono::Duration::nanoseconds(123_456_789),
        };

        let decoded = BucketState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.available_tokens.to_bits(), state.available_tokens.to_bits());
    }
}
