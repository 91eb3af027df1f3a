//! In-memory object store backend
//!
//! Objects live in a shared arena; the digest index is the same trie
//! algorithm the on-disk backend uses, with heap nodes instead of a mapped
//! file.

use super::{next_store_id, object_digest, ObjectHandle, ObjectRef, ObjectStore};
use crate::digest::CasId;
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::trie::memory::MemoryTrie;
use parking_lot::RwLock;
use std::sync::Arc;

struct StoredObject {
    id: CasId,
    data: Arc<[u8]>,
    refs: Arc<[ObjectRef]>,
}

/// Thread-safe in-memory CAS backend.
pub struct InMemoryObjectStore {
    store_id: u64,
    index: MemoryTrie<u64>,
    arena: RwLock<Vec<StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            store_id: next_store_id(),
            index: MemoryTrie::new(),
            arena: RwLock::new(Vec::new()),
        }
    }

    fn record(&self, reference: ObjectRef) -> Result<ObjectHandle> {
        let arena = self.arena.read();
        let object = arena
            .get(reference.index() as usize)
            .ok_or_else(|| CacheError::NotFound {
                what: "object",
                id: format!("#{}", reference.index()),
                recovery_hint: RecoveryHint::NoRecovery,
            })?;
        Ok(ObjectHandle::new(
            reference,
            object.id,
            Arc::clone(&object.data),
            Arc::clone(&object.refs),
        ))
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef> {
        let ref_digests = {
            let arena = self.arena.read();
            refs.iter()
                .map(|reference| {
                    reference.check_store(self.store_id)?;
                    arena
                        .get(reference.index() as usize)
                        .map(|object| *object.id.digest())
                        .ok_or_else(|| CacheError::NotFound {
                            what: "referenced object",
                            id: format!("#{}", reference.index()),
                            recovery_hint: RecoveryHint::NoRecovery,
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let digest = object_digest(&ref_digests, data);
        let (index, inserted) = self.index.insert_lazy(digest.as_bytes(), || {
            let mut arena = self.arena.write();
            arena.push(StoredObject {
                id: CasId::new(digest),
                data: Arc::from(data),
                refs: Arc::from(refs),
            });
            (arena.len() - 1) as u64
        });
        if inserted {
            tracing::trace!(id = %digest, bytes = data.len(), refs = refs.len(), "stored object");
        }
        Ok(ObjectRef::new(self.store_id, *index))
    }

    fn load(&self, reference: ObjectRef) -> Result<ObjectHandle> {
        reference.check_store(self.store_id)?;
        self.record(reference)
    }

    fn get_reference(&self, id: &CasId) -> Result<Option<ObjectRef>> {
        Ok(self
            .index
            .find(id.digest().as_bytes())
            .map(|index| ObjectRef::new(self.store_id, *index)))
    }

    fn get_id(&self, reference: ObjectRef) -> Result<CasId> {
        reference.check_store(self.store_id)?;
        Ok(self.record(reference)?.id())
    }

    fn validate(&self, id: &CasId) -> Result<()> {
        let reference = self.get_reference(id)?.ok_or_else(|| CacheError::NotFound {
            what: "object",
            id: id.to_string(),
            recovery_hint: RecoveryHint::Ignore,
        })?;
        let handle = self.load(reference)?;
        let ref_digests = handle
            .refs()
            .map(|r| self.get_id(r).map(|id| *id.digest()))
            .collect::<Result<Vec<_>>>()?;
        let recomputed = object_digest(&ref_digests, handle.data());
        if &recomputed == id.digest() {
            Ok(())
        } else {
            Err(CacheError::corruption(
                "<in-memory>",
                format!("object '{id}' hashes to '{recomputed}'"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_round_trip() {
        let store = InMemoryObjectStore::new();
        let leaf = store.store(&[], b"leaf data").unwrap();
        let node = store.store(&[leaf, leaf], b"node data").unwrap();

        let handle = store.load(node).unwrap();
        assert_eq!(handle.data(), b"node data");
        assert_eq!(handle.num_refs(), 2);
        assert_eq!(handle.ref_at(0), Some(leaf));
        assert_eq!(handle.ref_at(1), Some(leaf));
        assert_eq!(handle.ref_at(2), None);

        let leaf_handle = store.load(leaf).unwrap();
        assert_eq!(leaf_handle.data(), b"leaf data");
        assert_eq!(leaf_handle.num_refs(), 0);
    }

    #[test]
    fn test_store_is_idempotent() {
        let store = InMemoryObjectStore::new();
        let first = store.store(&[], b"same").unwrap();
        let second = store.store(&[], b"same").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.get_id(first).unwrap(),
            store.get_id(second).unwrap()
        );
    }

    #[test]
    fn test_content_addressing_matches_digest() {
        let store = InMemoryObjectStore::new();
        let reference = store.store(&[], b"addressed").unwrap();
        let id = store.get_id(reference).unwrap();
        assert_eq!(*id.digest(), object_digest(&[], b"addressed"));
        assert_eq!(store.get_reference(&id).unwrap(), Some(reference));
    }

    #[test]
    fn test_distinct_stores_have_distinct_ids() {
        let a = InMemoryObjectStore::new();
        let b = InMemoryObjectStore::new();
        let in_a = a.store(&[], b"1").unwrap();
        let in_b = b.store(&[], b"1").unwrap();
        // Same content, same CASID, different store-scoped handles.
        assert_eq!(a.get_id(in_a).unwrap(), b.get_id(in_b).unwrap());
        assert_ne!(in_a, in_b);
    }

    #[test]
    fn test_cross_store_reference_is_rejected() {
        let a = InMemoryObjectStore::new();
        let b = InMemoryObjectStore::new();
        let in_a = a.store(&[], b"1").unwrap();

        let err = b.load(in_a).unwrap_err();
        assert!(matches!(err, CacheError::ConfigMismatch { .. }), "{err}");
        let err = b.store(&[in_a], b"child").unwrap_err();
        assert!(matches!(err, CacheError::ConfigMismatch { .. }), "{err}");
    }

    #[test]
    fn test_unknown_id_has_no_reference() {
        let store = InMemoryObjectStore::new();
        let other = InMemoryObjectStore::new();
        let id = other.get_id(other.store(&[], b"elsewhere").unwrap()).unwrap();
        assert_eq!(store.get_reference(&id).unwrap(), None);
        assert!(!store.contains(&id).unwrap());
    }

    #[test]
    fn test_create_proxy_is_store_plus_load() {
        let store = InMemoryObjectStore::new();
        let proxy = store.create_proxy(&[], b"proxied").unwrap();
        assert_eq!(proxy.data(), b"proxied");
        assert_eq!(store.get_reference(&proxy.id()).unwrap(), Some(proxy.reference()));
    }

    #[test]
    fn test_validate_accepts_stored_objects() {
        let store = InMemoryObjectStore::new();
        let leaf = store.store(&[], b"leaf").unwrap();
        let node = store.store(&[leaf], b"node").unwrap();
        store.validate(&store.get_id(node).unwrap()).unwrap();
        store.validate(&store.get_id(leaf).unwrap()).unwrap();
    }

    #[test]
    fn test_empty_object() {
        let store = InMemoryObjectStore::new();
        let empty = store.store(&[], b"").unwrap();
        let handle = store.load(empty).unwrap();
        assert!(handle.data().is_empty());
        assert_eq!(handle.num_refs(), 0);
    }

    #[test]
    fn test_concurrent_stores_of_identical_content_collapse() {
        let store = InMemoryObjectStore::new();
        let refs: Vec<_> = std::thread::scope(|scope| {
            (0..16)
                .map(|_| scope.spawn(|| store.store(&[], b"contended").unwrap()))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert!(refs.windows(2).all(|w| w[0] == w[1]));
    }
}
