//! The process-wide token → capability cache.
//!
//! Authoritative for the lifetime of a token: once a token has been resolved
//! to a capability, every subsequent request presenting it is served from
//! here. Invalidation is external (token expiry is observed by the issuer,
//! not by the cache); the only eviction is the LRU size bound.
//!
//! Reads take the shared lock and do not promote (recency is updated on
//! insert); writes take the exclusive lock. Never both from the same task.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::RwLock;

use kurbisio_core::Capability;

/// Default size bound. Large enough for any realistic token population;
/// small enough to bound memory when tokens are minted per request.
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct CapabilityCache {
    inner: RwLock<LruCache<String, Capability>>,
}

impl CapabilityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).expect("nonzero default"));
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, token: &str) -> Option<Capability> {
        self.inner.read().await.peek(token).cloned()
    }

    pub async fn put(&self, token: &str, capability: Capability) {
        self.inner.write().await.put(token.to_owned(), capability);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
