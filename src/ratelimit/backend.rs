//! Backing store trait for bucket state.

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;

use super::bucket::BucketState;

/// Anything usable as a subject key: client id, API token, IP address.
pub trait SubjectKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> SubjectKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Address of one bucket: a subject plus the index of the rule it tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey<K> {
    pub subject: K,
    pub rule_index: usize,
}

impl<K> BucketKey<K> {
    pub fn new(subject: K, rule_index: usize) -> Self {
        Self { subject, rule_index }
    }
}

impl<K: Debug> fmt::Display for BucketKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.subject, self.rule_index)
    }
}

/// Errors a backing store can report.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached. Worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A single store operation took longer than allowed.
    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),
    /// A stored record could not be decoded.
    #[error("corrupt bucket record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Key-value store holding bucket state with atomic compare-and-set.
///
/// Any cache or database that can replace a value only if it still equals an
/// expected value satisfies this trait. The token bucket store builds its
/// read-modify-write loop on top of these two operations.
#[async_trait]
pub trait BucketBackend<K: SubjectKey>: Send + Sync {
    /// Fetch the current state of a bucket, if it exists.
    async fn get(&self, key: &BucketKey<K>) -> Result<Option<BucketState>, BackendError>;

    /// Replace the bucket with `new_state` only if it currently equals `expected`.
    ///
    /// `expected = None` means "only if the bucket does not exist yet". Returns
    /// `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &BucketKey<K>,
        expected: Option<&BucketState>,
        new_state: &BucketState,
    ) -> Result<bool, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_display() {
        let key = BucketKey::new("client-a".to_string(), 2);
        assert_eq!(key.to_string(), "\"client-a\"#2");
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(BackendError::Unavailable("down".to_string()).is_transient());
        assert!(!BackendError::Timeout(Duration::from_millis(5)).is_transient());
    }
}
