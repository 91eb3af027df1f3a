//! Pluggable action-cache backend
//!
//! The host-side contract for an externally provided cache (typically a
//! dynamically loaded service client). Scalar get/put mirror the built-in
//! backends; the map variant binds a digest to a sequence of named entries
//! whose values are looked up asynchronously by index. Every operation is
//! tri-state: found, not found, or a backend error.
//!
//! [`RemoteActionCache`] adapts any backend to the [`ActionCache`]
//! contract, keeping the insert-or-verify and dangling-value semantics on
//! the host side so a permissive backend cannot weaken them.

use super::{resolve_value, verify_existing, ActionCache};
use crate::digest::{CasId, Digest};
use crate::errors::Result;
use crate::store::{ObjectRef, ObjectStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// One named entry of a map value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub name: String,
    pub value: Digest,
}

/// Operations an external cache backend must provide.
///
/// Mirrors the dynamically loaded function table: object store and digest
/// print/parse alongside the scalar and map action-cache entry points. A
/// backend missing any required operation simply cannot implement the
/// trait, the static analogue of a plugin failing to load over a missing
/// symbol.
#[async_trait]
pub trait RemoteCacheBackend: Send + Sync {
    /// Identifier used in error reports.
    fn name(&self) -> &str;

    /// Store an object by its canonical parts, returning its digest.
    fn store_object(&self, refs: &[Digest], data: &[u8]) -> Result<Digest>;

    /// Load an object's `(refs, data)`; `Ok(None)` when unknown.
    fn load_object(&self, id: &Digest) -> Result<Option<(Vec<Digest>, Vec<u8>)>>;

    /// Textual digest form; the default matches the host's.
    fn print_digest(&self, id: &Digest) -> String {
        crate::digest::CasId::new(*id).to_string()
    }

    /// Parse a textual digest; the default matches the host's.
    fn parse_digest(&self, text: &str) -> Result<Digest> {
        Ok(*crate::digest::CasId::parse(text)?.digest())
    }

    /// Scalar lookup: `Ok(None)` is not-found, `Err` is a backend failure.
    fn get_action(&self, key: &Digest) -> Result<Option<Digest>>;

    /// Scalar insert. The adapter performs insert-or-verify before calling
    /// this, so the backend may overwrite blindly.
    fn put_action(&self, key: &Digest, value: &Digest) -> Result<()>;

    /// Number of entries in the map bound to `key`, if any.
    fn get_map_size(&self, key: &Digest) -> Result<Option<usize>>;

    /// Bind a map of named entries to `key`.
    fn put_map(&self, key: &Digest, entries: &[MapEntry]) -> Result<()>;

    /// Asynchronous per-index lookup into the map bound to `key`.
    async fn get_map_value(&self, key: &Digest, index: usize) -> Result<Option<MapEntry>>;
}

/// [`ActionCache`] adapter over a [`RemoteCacheBackend`].
pub struct RemoteActionCache {
    cas: Arc<dyn ObjectStore>,
    backend: Arc<dyn RemoteCacheBackend>,
    /// Keys this process already verified, so repeated puts of the same
    /// value skip a backend round trip.
    verified: DashMap<Digest, Digest>,
}

impl RemoteActionCache {
    pub fn new(cas: Arc<dyn ObjectStore>, backend: Arc<dyn RemoteCacheBackend>) -> Self {
        Self {
            cas,
            backend,
            verified: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &dyn RemoteCacheBackend {
        self.backend.as_ref()
    }
}

impl ActionCache for RemoteActionCache {
    fn get(&self, key: &CasId) -> Result<Option<ObjectRef>> {
        match self.backend.get_action(key.digest())? {
            None => Ok(None),
            Some(value) => resolve_value(self.cas.as_ref(), key, &value).map(Some),
        }
    }

    fn put(&self, key: &CasId, value: ObjectRef) -> Result<()> {
        let expected = *self.cas.get_id(value)?.digest();
        if let Some(cached) = self.verified.get(key.digest()) {
            let observed = *cached;
            drop(cached);
            return verify_existing(self.cas.as_ref(), key, &observed, &CasId::new(expected));
        }
        if let Some(observed) = self.backend.get_action(key.digest())? {
            verify_existing(self.cas.as_ref(), key, &observed, &CasId::new(expected))?;
            self.verified.insert(*key.digest(), observed);
            return Ok(());
        }
        self.backend.put_action(key.digest(), &expected)?;
        self.verified.insert(*key.digest(), expected);
        tracing::trace!(
            backend = self.backend.name(),
            key = %key,
            "cached action result remotely"
        );
        Ok(())
    }
}
