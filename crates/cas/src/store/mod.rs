//! Content-addressed object store
//!
//! An object is an immutable `(refs, data)` pair named by the digest of its
//! canonical encoding. Storing is idempotent: identical content collapses to
//! one copy and one id. References always resolve within the store that
//! issued them (a store never dangles), and [`ObjectRef`] values are
//! rejected when presented to a different store instance.

pub mod disk;
pub mod memory;

use crate::digest::{CasId, Digest, DigestHasher};
use crate::errors::{CacheError, RecoveryHint, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use disk::OnDiskObjectStore;
pub use memory::InMemoryObjectStore;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_store_id() -> u64 {
    NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Store-scoped handle to an object.
///
/// Holding one is proof the object is addressable in its store, though its
/// content may not be loaded yet. The backing index is only meaningful to
/// the store instance that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    store_id: u64,
    index: u64,
}

impl ObjectRef {
    pub(crate) fn new(store_id: u64, index: u64) -> Self {
        Self { store_id, index }
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn check_store(&self, store_id: u64) -> Result<()> {
        if self.store_id == store_id {
            Ok(())
        } else {
            Err(CacheError::ConfigMismatch {
                reason: format!(
                    "object reference from store #{} used with store #{}",
                    self.store_id, store_id
                ),
                recovery_hint: RecoveryHint::NoRecovery,
            })
        }
    }
}

/// A loaded view of an object: its id, data, and outgoing references.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    reference: ObjectRef,
    id: CasId,
    data: Arc<[u8]>,
    refs: Arc<[ObjectRef]>,
}

impl ObjectHandle {
    pub(crate) fn new(
        reference: ObjectRef,
        id: CasId,
        data: Arc<[u8]>,
        refs: Arc<[ObjectRef]>,
    ) -> Self {
        Self {
            reference,
            id,
            data,
            refs,
        }
    }

    pub fn reference(&self) -> ObjectRef {
        self.reference
    }

    pub fn id(&self) -> CasId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_refs(&self) -> usize {
        self.refs.len()
    }

    pub fn ref_at(&self, index: usize) -> Option<ObjectRef> {
        self.refs.get(index).copied()
    }

    pub fn refs(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.refs.iter().copied()
    }

    pub fn for_each_ref<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(ObjectRef) -> Result<()>,
    {
        for reference in self.refs.iter() {
            callback(*reference)?;
        }
        Ok(())
    }
}

/// The CAS contract implemented by the in-memory and on-disk backends.
pub trait ObjectStore: Send + Sync {
    /// Store `(refs, data)`, returning a reference to the deduplicated
    /// object. Idempotent.
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef>;

    /// Materialize an object's content. May perform I/O.
    fn load(&self, reference: ObjectRef) -> Result<ObjectHandle>;

    /// Look up an id without loading content; `None` when unknown here.
    fn get_reference(&self, id: &CasId) -> Result<Option<ObjectRef>>;

    /// The portable identity of a referenced object.
    fn get_id(&self, reference: ObjectRef) -> Result<CasId>;

    /// Integrity check: recompute the digest of the stored content.
    fn validate(&self, id: &CasId) -> Result<()>;

    fn contains(&self, id: &CasId) -> Result<bool> {
        Ok(self.get_reference(id)?.is_some())
    }

    /// Store then load in one step.
    fn create_proxy(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectHandle> {
        let reference = self.store(refs, data)?;
        self.load(reference)
    }

    fn parse_id(&self, text: &str) -> Result<CasId> {
        CasId::parse(text)
    }

    fn print_id(&self, id: &CasId) -> String {
        id.to_string()
    }
}

/// Digest of the canonical object encoding:
/// `num_refs (u64 LE) || ref digests || data`.
///
/// Public so external backends can compute host-compatible object ids.
pub fn object_digest(ref_digests: &[Digest], data: &[u8]) -> Digest {
    let mut hasher = DigestHasher::new();
    hasher.update(&(ref_digests.len() as u64).to_le_bytes());
    for digest in ref_digests {
        hasher.update(digest.as_bytes());
    }
    hasher.update(data);
    hasher.finalize()
}
