//! Notification of subjects going over their limits.

use serde::Serialize;
use tracing::warn;

use super::backend::SubjectKey;
use super::limiter::RateLimitOutcome;

/// Passed to the notifier when an evaluation decides the subject is over limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateExceededEvent<K> {
    /// The subject that exceeded its rate
    pub subject_key: K,
    /// The evaluation that triggered the event
    pub outcome: RateLimitOutcome,
    /// Name of the limiter that produced the event
    pub source: String,
}

/// Receives exceeded events.
///
/// Called synchronously from `evaluate`, so a slow implementation stalls the
/// caller. Hand work off to a channel or task if delivery may block.
pub trait RateExceededNotifier<K: SubjectKey>: Send + Sync {
    fn on_rate_exceeded(&self, event: &RateExceededEvent<K>);
}

impl<K, F> RateExceededNotifier<K> for F
where
    K: SubjectKey,
    F: Fn(&RateExceededEvent<K>) + Send + Sync,
{
    fn on_rate_exceeded(&self, event: &RateExceededEvent<K>) {
        self(event)
    }
}

/// Logs every exceeded event at `warn` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl<K: SubjectKey> RateExceededNotifier<K> for LoggingNotifier {
    fn on_rate_exceeded(&self, event: &RateExceededEvent<K>) {
        warn!(
            source = %event.source,
            subject = ?event.subject_key,
            first_exceeded_rule = ?event.outcome.first_exceeded_rule,
            results = ?event.outcome.per_rule_results,
            "Rate limit exceeded"
        );
    }
}

/// Ignores exceeded events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl<K: SubjectKey> RateExceededNotifier<K> for NoopNotifier {
    fn on_rate_exceeded(&self, _event: &RateExceededEvent<K>) {}
}
