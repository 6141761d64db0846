//! Rate rules and limiter configuration.
//!
//! A limiter is configured with an ordered list of rules plus one combination
//! logic. The serde-facing [`RateLimitConfig`] is what rule files contain; it is
//! validated into an immutable [`RateLimiterConfiguration`] before any limiter
//! can be built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimiterError, Result};

/// Name given to limiters whose configuration does not name them.
pub const DEFAULT_LIMITER_NAME: &str = "rate-limiter";

/// One independent limit: `capacity` tokens refilled continuously over `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RateRule {
    capacity: u64,
    period: Duration,
}

impl RateRule {
    /// Create a rule. Both capacity and period must be strictly positive.
    pub fn new(capacity: u64, period: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(RateLimiterError::Config(
                "rate rule capacity must be greater than zero".to_string(),
            ));
        }
        if period.is_zero() {
            return Err(RateLimiterError::Config(
                "rate rule period must be greater than zero".to_string(),
            ));
        }
        Ok(Self { capacity, period })
    }

    /// Maximum number of tokens a bucket for this rule can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Time it takes to refill an empty bucket completely.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.capacity as f64 / self.period.as_secs_f64()
    }
}

impl fmt::Display for RateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.capacity, self.period)
    }
}

/// How per-rule outcomes combine into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CombinationLogic {
    /// Exceeded only when every rule failed (AND).
    #[serde(rename = "ALL", alias = "all", alias = "AND", alias = "and")]
    All,
    /// Exceeded as soon as any rule failed (OR).
    #[default]
    #[serde(rename = "ANY", alias = "any", alias = "OR", alias = "or")]
    Any,
}

impl CombinationLogic {
    /// Decide whether the subject is over limit given each rule's pass/fail result.
    pub fn is_exceeded(&self, per_rule_results: &[bool]) -> bool {
        match self {
            CombinationLogic::Any => per_rule_results.iter().any(|passed| !passed),
            CombinationLogic::All => {
                !per_rule_results.is_empty() && per_rule_results.iter().all(|passed| !passed)
            }
        }
    }
}

/// Validated, immutable limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfiguration {
    name: String,
    rules: Vec<RateRule>,
    logic: CombinationLogic,
}

impl RateLimiterConfiguration {
    /// Create a configuration. Fails if the rule list is empty.
    pub fn new(rules: Vec<RateRule>, logic: CombinationLogic) -> Result<Self> {
        if rules.is_empty() {
            return Err(RateLimiterError::Config(
                "at least one rate rule is required".to_string(),
            ));
        }
        Ok(Self {
            name: DEFAULT_LIMITER_NAME.to_string(),
            rules,
            logic,
        })
    }

    /// Set the name reported as the source of exceeded events.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rules in configuration order. The index of a rule identifies its bucket.
    pub fn rules(&self) -> &[RateRule] {
        &self.rules
    }

    pub fn logic(&self) -> CombinationLogic {
        self.logic
    }
}

/// Time unit for configured rule durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert `amount` of this unit into a duration, or `None` on overflow.
    pub fn to_duration(&self, amount: u64) -> Option<Duration> {
        let secs = |per: u64| amount.checked_mul(per).map(Duration::from_secs);
        match self {
            TimeUnit::Nanoseconds => Some(Duration::from_nanos(amount)),
            TimeUnit::Microseconds => Some(Duration::from_micros(amount)),
            TimeUnit::Milliseconds => Some(Duration::from_millis(amount)),
            TimeUnit::Seconds => Some(Duration::from_secs(amount)),
            TimeUnit::Minutes => secs(60),
            TimeUnit::Hours => secs(3600),
            TimeUnit::Days => secs(86400),
        }
    }
}

/// A single configured limit as it appears in a rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Number of requests allowed per duration
    pub limit: u64,
    /// How many time units the limit spans
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// The time unit
    #[serde(default)]
    pub time_unit: TimeUnit,
}

fn default_duration() -> u64 {
    1
}

impl RateConfig {
    /// Validate into a [`RateRule`].
    pub fn to_rule(&self) -> Result<RateRule> {
        let period = self.time_unit.to_duration(self.duration).ok_or_else(|| {
            RateLimiterError::Config(format!(
                "rate duration {} {:?} is out of range",
                self.duration, self.time_unit
            ))
        })?;
        RateRule::new(self.limit, period)
    }
}

/// Rule file contents: an ordered list of limits and how to combine them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Name reported as the source of exceeded events
    #[serde(default)]
    pub name: Option<String>,
    /// Combination logic across all limits
    #[serde(default)]
    pub logic: CombinationLogic,
    /// Limits in evaluation order
    #[serde(default)]
    pub limits: Vec<RateConfig>,
}

impl RateLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimiterError::Config(format!("Failed to parse rate limit config: {}", e)))
    }

    /// Validate every limit and produce the immutable limiter configuration.
    pub fn to_configuration(&self) -> Result<RateLimiterConfiguration> {
        let rules = self
            .limits
            .iter()
            .enumerate()
            .map(|(index, limit)| {
                limit.to_rule().map_err(|e| match e {
                    RateLimiterError::Config(msg) => {
                        RateLimiterError::Config(format!("limit #{}: {}", index, msg))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let configuration = RateLimiterConfiguration::new(rules, self.logic)?;
        Ok(match &self.name {
            Some(name) => configuration.with_name(name.clone()),
            None => configuration,
        })
    }
}

impl TryFrom<&RateLimitConfig> for RateLimiterConfiguration {
    type Error = RateLimiterError;

    fn try_from(config: &RateLimitConfig) -> Result<Self> {
        config.to_configuration()
    }
}
