//! Rate limiting logic and bucket state management.

mod backend;
mod bucket;
mod clock;
mod limiter;
mod memory;
mod notifier;
mod rules;
mod store;

pub use backend::{BackendError, BucketBackend, BucketKey, SubjectKey};
pub use bucket::BucketState;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{RateLimitOutcome, RateLimiterEngine};
pub use memory::InMemoryBackend;
pub use notifier::{LoggingNotifier, NoopNotifier, RateExceededEvent, RateExceededNotifier};
pub use rules::{
    CombinationLogic, RateConfig, RateLimitConfig, RateLimiterConfiguration, RateRule, TimeUnit,
    DEFAULT_LIMITER_NAME,
};
pub use store::{StoreSettings, TokenBucketStore, DEFAULT_MAX_ATTEMPTS};
