//! In-process bucket backend for single-node deployments.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::backend::{BackendError, BucketBackend, BucketKey, SubjectKey};
use super::bucket::BucketState;

/// Bucket backend on a sharded concurrent map.
///
/// Compare-and-set runs while holding the entry's shard lock, which gives the
/// per-key serialization a remote store would provide. Records are kept
/// encoded, the same way they would sit in an external cache.
#[derive(Debug)]
pub struct InMemoryBackend<K: SubjectKey> {
    buckets: DashMap<BucketKey<K>, Vec<u8>>,
}

impl<K: SubjectKey> InMemoryBackend<K> {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Drop all buckets belonging to one subject, across every rule.
    pub fn remove_subject(&self, subject: &K) {
        self.buckets.retain(|key, _| &key.subject != subject);
    }
}

impl<K: SubjectKey> Default for InMemoryBackend<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: SubjectKey> BucketBackend<K> for InMemoryBackend<K> {
    async fn get(&self, key: &BucketKey<K>) -> Result<Option<BucketState>, BackendError> {
        match self.buckets.get(key) {
            Some(record) => Ok(Some(BucketState::decode(record.value())?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        key: &BucketKey<K>,
        expected: Option<&BucketState>,
        new_state: &BucketState,
    ) -> Result<bool, BackendError> {
        let encoded = new_state.encode()?;

        match self.buckets.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                trace!(key = %key, "Creating bucket");
                vacant.insert(encoded);
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let Some(expected) = expected else {
                    return Ok(false);
                };
                let current = BucketState::decode(occupied.get())?;
                if current != *expected {
                    return Ok(false);
                }
                occupied.insert(encoded);
                Ok(true)
            }
        }
    }
}
