//! Multi-rule rate limiter engine.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{BucketBackend, SubjectKey};
use super::notifier::{RateExceededEvent, RateExceededNotifier};
use super::rules::{CombinationLogic, RateLimiterConfiguration, RateRule};
use super::store::TokenBucketStore;
use crate::error::Result;

/// Tokens taken from each rule's bucket per evaluation.
const TOKENS_PER_EVALUATION: u64 = 1;

/// Result of evaluating every rule for one subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitOutcome {
    /// Aggregate verdict under the limiter's combination logic
    pub exceeded: bool,
    /// Position of the first rule that refused a token
    pub first_exceeded_index: Option<usize>,
    /// The first rule that refused a token
    pub first_exceeded_rule: Option<RateRule>,
    /// Pass/fail per rule, in configuration order
    pub per_rule_results: Vec<bool>,
}

impl RateLimitOutcome {
    /// Combine per-rule results. `per_rule_results[i]` belongs to `rules[i]`.
    pub fn aggregate(logic: CombinationLogic, rules: &[RateRule], per_rule_results: Vec<bool>) -> Self {
        let first_exceeded_index = per_rule_results.iter().position(|passed| !passed);
        Self {
            exceeded: logic.is_exceeded(&per_rule_results),
            first_exceeded_index,
            first_exceeded_rule: first_exceeded_index.and_then(|i| rules.get(i).copied()),
            per_rule_results,
        }
    }
}

/// Evaluates all configured rules for a subject and reports overages.
///
/// The engine holds no per-subject state; everything lives in the bucket store,
/// so one engine can be shared across tasks and evaluate the same subject
/// concurrently.
pub struct RateLimiterEngine<K: SubjectKey, B: BucketBackend<K>> {
    configuration: RateLimiterConfiguration,
    store: TokenBucketStore<K, B>,
    notifier: Arc<dyn RateExceededNotifier<K>>,
}

impl<K: SubjectKey, B: BucketBackend<K>> RateLimiterEngine<K, B> {
    pub fn new(
        configuration: RateLimiterConfiguration,
        store: TokenBucketStore<K, B>,
        notifier: Arc<dyn RateExceededNotifier<K>>,
    ) -> Self {
        debug!(
            name = %configuration.name(),
            logic = ?configuration.logic(),
            rules = configuration.rules().len(),
            "Creating rate limiter"
        );
        Self {
            configuration,
            store,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        self.configuration.name()
    }

    pub fn configuration(&self) -> &RateLimiterConfiguration {
        &self.configuration
    }

    pub fn store(&self) -> &TokenBucketStore<K, B> {
        &self.store
    }

    /// Record one request for `subject` against every rule.
    ///
    /// Every rule's bucket is charged, even once an earlier rule has refused.
    /// The per-rule consumptions run concurrently and the verdict waits for all
    /// of them. If any of them cannot reach the store the whole evaluation fails
    /// with `StoreUnavailable`; there is no partial outcome.
    pub async fn evaluate(&self, subject: &K) -> Result<RateLimitOutcome> {
        let rules = self.configuration.rules();

        trace!(limiter = %self.name(), subject = ?subject, "Evaluating rate limits");

        let consumptions = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| self.store.try_consume(subject, index, rule, TOKENS_PER_EVALUATION));
        let per_rule_results = join_all(consumptions)
            .await
            .into_iter()
            .collect::<Result<Vec<bool>>>()?;

        let outcome = RateLimitOutcome::aggregate(self.configuration.logic(), rules, per_rule_results);

        debug!(
            limiter = %self.name(),
            subject = ?subject,
            exceeded = outcome.exceeded,
            first_exceeded_rule = ?outcome.first_exceeded_rule,
            limits = ?rules,
            "Rate limits evaluated"
        );

        if outcome.exceeded {
            self.notifier.on_rate_exceeded(&RateExceededEvent {
                subject_key: subject.clone(),
                outcome: outcome.clone(),
                source: self.name().to_string(),
            });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimiterError;
    use crate::ratelimit::backend::{BackendError, BucketKey};
    use crate::ratelimit::bucket::BucketState;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::InMemoryBackend;
    use crate::ratelimit::notifier::NoopNotifier;
    use crate::ratelimit::rules::RateLimitConfig;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Keeps every event it receives.
    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<RateExceededEvent<String>>>,
    }

    impl RateExceededNotifier<String> for RecordingNotifier {
        fn on_rate_exceeded(&self, event: &RateExceededEvent<String>) {
            self.events.lock().push(event.clone());
        }
    }

    fn manual_clock() -> ManualClock {
        ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    fn two_rules(logic: CombinationLogic) -> RateLimiterConfiguration {
        RateLimiterConfiguration::new(
            vec![
                RateRule::new(1, Duration::from_secs(1)).unwrap(),
                RateRule::new(100, Duration::from_secs(1)).unwrap(),
            ],
            logic,
        )
        .unwrap()
    }

    fn create_engine(
        configuration: RateLimiterConfiguration,
        clock: &ManualClock,
        notifier: Arc<RecordingNotifier>,
    ) -> RateLimiterEngine<String, InMemoryBackend<String>> {
        let store = TokenBucketStore::with_clock(InMemoryBackend::new(), Arc::new(clock.clone()));
        RateLimiterEngine::new(configuration, store, notifier)
    }

    #[tokio::test]
    async fn test_any_logic_exceeds_when_one_rule_fails() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(two_rules(CombinationLogic::Any), &clock, notifier.clone());
        let subject = "client".to_string();

        let first = engine.evaluate(&subject).await.unwrap();
        assert!(!first.exceeded);
        assert_eq!(first.per_rule_results, vec![true, true]);
        assert_eq!(first.first_exceeded_rule, None);

        let second = engine.evaluate(&subject).await.unwrap();
        assert!(second.exceeded);
        assert_eq!(second.per_rule_results, vec![false, true]);
        assert_eq!(second.first_exceeded_index, Some(0));
        assert_eq!(second.first_exceeded_rule, Some(engine.configuration().rules()[0]));

        let events = notifier.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_key, "client");
        assert_eq!(events[0].outcome, second);
        assert_eq!(events[0].source, engine.name());
    }

    #[tokio::test]
    async fn test_all_logic_needs_every_rule_to_fail() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(two_rules(CombinationLogic::All), &clock, notifier.clone());
        let subject = "client".to_string();

        engine.evaluate(&subject).await.unwrap();
        let second = engine.evaluate(&subject).await.unwrap();

        assert!(!second.exceeded);
        assert_eq!(second.per_rule_results, vec![false, true]);
        assert_eq!(second.first_exceeded_index, Some(0));
        assert!(notifier.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_all_logic_exceeds_when_every_rule_fails() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let configuration = RateLimiterConfiguration::new(
            vec![
                RateRule::new(1, Duration::from_secs(1)).unwrap(),
                RateRule::new(2, Duration::from_secs(60)).unwrap(),
            ],
            CombinationLogic::All,
        )
        .unwrap();
        let engine = create_engine(configuration, &clock, notifier.clone());
        let subject = "client".to_string();

        engine.evaluate(&subject).await.unwrap();
        engine.evaluate(&subject).await.unwrap();
        let third = engine.evaluate(&subject).await.unwrap();

        assert!(third.exceeded);
        assert_eq!(third.per_rule_results, vec![false, false]);
        assert_eq!(notifier.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_every_bucket_is_charged() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(two_rules(CombinationLogic::Any), &clock, notifier);
        let subject = "client".to_string();

        for _ in 0..5 {
            engine.evaluate(&subject).await.unwrap();
        }

        let key = BucketKey::new(subject, 1);
        let state = engine.store().backend().get(&key).await.unwrap().unwrap();
        assert_eq!(state.available_tokens, 95.0);
    }

    #[tokio::test]
    async fn test_tokens_return_after_refill() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(two_rules(CombinationLogic::Any), &clock, notifier);
        let subject = "client".to_string();

        engine.evaluate(&subject).await.unwrap();
        assert!(engine.evaluate(&subject).await.unwrap().exceeded);

        clock.advance(Duration::from_secs(1));
        assert!(!engine.evaluate(&subject).await.unwrap().exceeded);
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(two_rules(CombinationLogic::Any), &clock, notifier);

        assert!(!engine.evaluate(&"a".to_string()).await.unwrap().exceeded);
        assert!(!engine.evaluate(&"b".to_string()).await.unwrap().exceeded);
        assert!(engine.evaluate(&"a".to_string()).await.unwrap().exceeded);
    }

    #[tokio::test]
    async fn test_engine_from_rule_file() {
        let yaml = r#"
name: api
logic: OR
limits:
  - limit: 2
    duration: 1
    time_unit: minutes
"#;
        let configuration = RateLimitConfig::from_yaml(yaml).unwrap().to_configuration().unwrap();
        let clock = manual_clock();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = create_engine(configuration, &clock, notifier.clone());
        let subject = "client".to_string();

        assert!(!engine.evaluate(&subject).await.unwrap().exceeded);
        assert!(!engine.evaluate(&subject).await.unwrap().exceeded);
        assert!(engine.evaluate(&subject).await.unwrap().exceeded);
        assert_eq!(notifier.events.lock()[0].source, "api");
    }

    /// Serves rule 0 from memory and fails every call for rule 1.
    struct PartiallyDownBackend {
        healthy: InMemoryBackend<String>,
    }

    #[async_trait]
    impl BucketBackend<String> for PartiallyDownBackend {
        async fn get(&self, key: &BucketKey<String>) -> std::result::Result<Option<BucketState>, BackendError> {
            if key.rule_index == 1 {
                return Err(BackendError::Unavailable("shard offline".to_string()));
            }
            self.healthy.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &BucketKey<String>,
            expected: Option<&BucketState>,
            new_state: &BucketState,
        ) -> std::result::Result<bool, BackendError> {
            self.healthy.compare_and_set(key, expected, new_state).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_evaluation() {
        let backend = PartiallyDownBackend {
            healthy: InMemoryBackend::new(),
        };
        let store = TokenBucketStore::new(backend).with_settings(crate::ratelimit::store::StoreSettings {
            max_attempts: 2,
            ..Default::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = RateLimiterEngine::new(two_rules(CombinationLogic::Any), store, notifier.clone());
        let subject = "client".to_string();

        let err = engine.evaluate(&subject).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::StoreUnavailable { attempts: 2, .. }));
        assert!(notifier.events.lock().is_empty());

        // Rule 0 was still charged before the failure surfaced
        let key = BucketKey::new(subject, 0);
        let state = engine.store().backend().healthy.get(&key).await.unwrap().unwrap();
        assert_eq!(state.available_tokens, 0.0);
    }

    #[tokio::test]
    async fn test_noop_notifier() {
        let store = TokenBucketStore::new(InMemoryBackend::<String>::new());
        let engine = RateLimiterEngine::new(two_rules(CombinationLogic::Any), store, Arc::new(NoopNotifier));
        let subject = "client".to_string();

        engine.evaluate(&subject).await.unwrap();
        assert!(engine.evaluate(&subject).await.unwrap().exceeded);
    }
}
