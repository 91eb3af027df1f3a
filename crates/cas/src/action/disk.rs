//! On-disk action cache backend
//!
//! One mapped trie file, `<root>/v1.actions`, keyed by action digest with
//! the result-object digest as the fixed payload. The paired object store
//! is a separate concern: several stores may share one cache file, which is
//! exactly how a dangling value arises (for example when a CAS is wiped
//! while the cache file persists).

use super::{resolve_value, verify_existing, ActionCache};
use crate::digest::{CasId, Digest, DIGEST_LEN};
use crate::errors::Result;
use crate::store::{ObjectRef, ObjectStore};
use crate::trie::disk::{DiskTrie, TrieConfig};
use std::path::Path;
use std::sync::Arc;

const ACTIONS_FILE: &str = "v1.actions";

/// Table name embedded in the `v1.actions` header.
pub const ACTION_CACHE_TABLE_NAME: &str = "llvm.actioncache[BLAKE3->BLAKE3]";

/// Action cache over a memory-mapped trie, paired with one object store.
pub struct OnDiskActionCache {
    cas: Arc<dyn ObjectStore>,
    trie: DiskTrie,
}

impl OnDiskActionCache {
    /// Open or create the cache under `root`, resolving values against
    /// `cas`.
    pub fn create(cas: Arc<dyn ObjectStore>, root: &Path, config: &TrieConfig) -> Result<Self> {
        let trie = DiskTrie::create(
            &root.join(ACTIONS_FILE),
            ACTION_CACHE_TABLE_NAME,
            DIGEST_LEN,
            config,
        )?;
        Ok(Self { cas, trie })
    }

    /// Flush mapped pages so other processes observe recent puts.
    pub fn flush(&self) -> Result<()> {
        self.trie.flush()
    }
}

impl ActionCache for OnDiskActionCache {
    fn get(&self, key: &CasId) -> Result<Option<ObjectRef>> {
        match self.trie.find(key.digest().as_bytes())? {
            None => Ok(None),
            Some(leaf) => {
                let value = Digest::from_bytes(&leaf.payload)?;
                resolve_value(self.cas.as_ref(), key, &value).map(Some)
            }
        }
    }

    fn put(&self, key: &CasId, value: ObjectRef) -> Result<()> {
        let expected = *self.cas.get_id(value)?.digest();
        let outcome = self.trie.insert_lazy(key.digest().as_bytes(), |payload| {
            payload.copy_from_slice(expected.as_bytes());
            Ok(())
        })?;
        if outcome.inserted {
            tracing::trace!(key = %key, value = %expected, "cached action result");
            return Ok(());
        }
        let observed = Digest::from_bytes(&outcome.record.payload)?;
        verify_existing(self.cas.as_ref(), key, &observed, &CasId::new(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CacheError;
    use crate::store::InMemoryObjectStore;
    use tempfile::TempDir;

    fn config() -> TrieConfig {
        TrieConfig {
            min_file_size: 4096,
            max_file_size: 64 * 1024 * 1024,
        }
    }

    #[test]
    fn test_hit_miss_and_rewrite() {
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(InMemoryObjectStore::new());
        let cache = OnDiskActionCache::create(cas.clone(), dir.path(), &config()).unwrap();

        let p1 = cas.create_proxy(&[], b"1").unwrap();
        let p2 = cas.create_proxy(&[], b"2").unwrap();

        assert_eq!(cache.get(&p1.id()).unwrap(), None);
        cache.put(&p1.id(), p2.reference()).unwrap();
        assert_eq!(cache.get(&p1.id()).unwrap(), Some(p2.reference()));

        // Idempotent re-put, poisoned rewrite.
        cache.put(&p1.id(), p2.reference()).unwrap();
        let err = cache.put(&p1.id(), p1.reference()).unwrap_err();
        assert!(matches!(err, CacheError::Poisoned { .. }), "{err}");
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(InMemoryObjectStore::new());
        let p = cas.create_proxy(&[], b"persisted").unwrap();

        {
            let cache = OnDiskActionCache::create(cas.clone(), dir.path(), &config()).unwrap();
            cache.put(&p.id(), p.reference()).unwrap();
            cache.flush().unwrap();
        }

        let cache = OnDiskActionCache::create(cas.clone(), dir.path(), &config()).unwrap();
        assert_eq!(cache.get(&p.id()).unwrap(), Some(p.reference()));
    }

    #[test]
    fn test_cross_store_value_dangles() {
        let dir = TempDir::new().unwrap();
        let cas1: Arc<InMemoryObjectStore> = Arc::new(InMemoryObjectStore::new());
        let cas2: Arc<InMemoryObjectStore> = Arc::new(InMemoryObjectStore::new());

        let p1 = cas1.create_proxy(&[], b"1").unwrap();
        let p2 = cas1.create_proxy(&[], b"2").unwrap();
        // Same content as p1, so the key digests agree across stores.
        let p3 = cas2.create_proxy(&[], b"1").unwrap();

        let cache1 = OnDiskActionCache::create(cas1.clone(), dir.path(), &config()).unwrap();
        cache1.put(&p1.id(), p2.reference()).unwrap();
        assert!(cache1.get(&p1.id()).unwrap().is_some());

        // Same cache file, different paired store: the stored value digest
        // names an object cas2 has never seen.
        let cache2 = OnDiskActionCache::create(cas2.clone(), dir.path(), &config()).unwrap();
        let err = cache2.get(&p3.id()).unwrap_err();
        assert!(matches!(err, CacheError::Dangling { .. }), "{err}");
        // And putting over the dangling entry still verifies against the
        // existing value, which resolves nowhere.
        let err = cache2.put(&p3.id(), p3.reference()).unwrap_err();
        assert!(matches!(err, CacheError::Dangling { .. }), "{err}");
    }
}
