//! In-memory action cache backend

use super::{resolve_value, verify_existing, ActionCache};
use crate::digest::{CasId, Digest};
use crate::errors::Result;
use crate::store::{ObjectRef, ObjectStore};
use crate::trie::memory::MemoryTrie;
use std::sync::Arc;

/// Action cache over a heap trie, paired with one object store.
pub struct InMemoryActionCache {
    cas: Arc<dyn ObjectStore>,
    cache: MemoryTrie<Digest>,
}

impl InMemoryActionCache {
    pub fn new(cas: Arc<dyn ObjectStore>) -> Self {
        Self {
            cas,
            cache: MemoryTrie::new(),
        }
    }
}

impl ActionCache for InMemoryActionCache {
    fn get(&self, key: &CasId) -> Result<Option<ObjectRef>> {
        match self.cache.find(key.digest().as_bytes()) {
            None => Ok(None),
            Some(value) => resolve_value(self.cas.as_ref(), key, value).map(Some),
        }
    }

    fn put(&self, key: &CasId, value: ObjectRef) -> Result<()> {
        let expected = *self.cas.get_id(value)?.digest();
        let (observed, inserted) = self
            .cache
            .insert_lazy(key.digest().as_bytes(), || expected);
        if inserted {
            tracing::trace!(key = %key, value = %expected, "cached action result");
            return Ok(());
        }
        let observed = *observed;
        verify_existing(self.cas.as_ref(), key, &observed, &CasId::new(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CacheError;
    use crate::store::InMemoryObjectStore;

    fn setup() -> (Arc<InMemoryObjectStore>, InMemoryActionCache) {
        let cas = Arc::new(InMemoryObjectStore::new());
        let cache = InMemoryActionCache::new(cas.clone());
        (cas, cache)
    }

    #[test]
    fn test_action_cache_hit() {
        let (cas, cache) = setup();
        let proxy = cas.create_proxy(&[], b"1").unwrap();
        cache.put(&proxy.id(), proxy.reference()).unwrap();
        assert_eq!(cache.get(&proxy.id()).unwrap(), Some(proxy.reference()));
    }

    #[test]
    fn test_action_cache_miss() {
        let (cas, cache) = setup();
        let p1 = cas.create_proxy(&[], b"1").unwrap();
        let p2 = cas.create_proxy(&[], b"2").unwrap();

        cache.put(&p1.id(), p2.reference()).unwrap();
        // Absent key is a miss, not an error.
        assert_eq!(cache.get(&p2.id()).unwrap(), None);

        cache.put(&p2.id(), p1.reference()).unwrap();
        assert_eq!(cache.get(&p2.id()).unwrap(), Some(p1.reference()));
    }

    #[test]
    fn test_action_cache_rewrite_is_poisoning() {
        let (cas, cache) = setup();
        let p1 = cas.create_proxy(&[], b"1").unwrap();
        let p2 = cas.create_proxy(&[], b"2").unwrap();

        cache.put(&p1.id(), p1.reference()).unwrap();
        let err = cache.put(&p1.id(), p2.reference()).unwrap_err();
        match err {
            CacheError::Poisoned { existing, new, .. } => {
                assert_eq!(existing, p1.id().to_string());
                assert_eq!(new, p2.id().to_string());
            }
            other => panic!("expected poisoning, got {other}"),
        }
        // Re-putting the original value is still fine.
        cache.put(&p1.id(), p1.reference()).unwrap();
    }

    #[test]
    fn test_racing_puts_of_same_value_all_succeed() {
        let (cas, cache) = setup();
        let proxy = cas.create_proxy(&[], b"contended").unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| cache.put(&proxy.id(), proxy.reference())))
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });
        assert_eq!(cache.get(&proxy.id()).unwrap(), Some(proxy.reference()));
    }
}
