//! Action cache
//!
//! A key→value map binding the digest of a canonicalized action to the
//! object naming its results. `put` is insert-or-verify: re-binding a key to
//! a different value is poisoning and always fails, which is what catches a
//! non-deterministic canonicalization. `get` fails with a dangling error
//! when the stored value names an object the paired store cannot resolve,
//! meaning the cache and store have drifted.

pub mod disk;
pub mod memory;
pub mod remote;

use crate::digest::{CasId, Digest};
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::store::{ObjectRef, ObjectStore};

pub use disk::{OnDiskActionCache, ACTION_CACHE_TABLE_NAME};
pub use memory::InMemoryActionCache;
pub use remote::{MapEntry, RemoteActionCache, RemoteCacheBackend};

/// The action-cache contract shared by every backend.
pub trait ActionCache: Send + Sync {
    /// Look up the value bound to `key`.
    ///
    /// `Ok(None)` when the key is absent. An entry whose value cannot be
    /// resolved in the paired object store is a [`CacheError::Dangling`].
    fn get(&self, key: &CasId) -> Result<Option<ObjectRef>>;

    /// Insert-or-verify: bind `key` to `value`, or verify an existing
    /// binding. A second `put` with the same value is idempotent; a
    /// different value is a [`CacheError::Poisoned`].
    fn put(&self, key: &CasId, value: ObjectRef) -> Result<()>;
}

/// Resolve a stored value digest through the paired store, turning an
/// unknown object into the dangling-value error.
pub(crate) fn resolve_value(
    cas: &dyn ObjectStore,
    key: &CasId,
    value: &Digest,
) -> Result<ObjectRef> {
    cas.get_reference(&CasId::new(*value))?
        .ok_or_else(|| CacheError::Dangling {
            key: key.to_string(),
            value: CasId::new(*value).to_string(),
            recovery_hint: RecoveryHint::ClearAndRetry,
        })
}

pub(crate) fn poisoned_error(key: &CasId, existing: &Digest, new: &CasId) -> CacheError {
    CacheError::Poisoned {
        key: key.to_string(),
        existing: CasId::new(*existing).to_string(),
        new: new.to_string(),
        recovery_hint: RecoveryHint::Manual {
            instructions: "the canonicalized action is not deterministic".to_string(),
        },
    }
}

/// Verify an existing binding against the value a `put` wants to write.
///
/// Equal values are the idempotent success case. An existing value that the
/// paired store cannot resolve is dangling: the cache and store have
/// drifted, and rebinding would mask that. Anything else is poisoning.
pub(crate) fn verify_existing(
    cas: &dyn ObjectStore,
    key: &CasId,
    observed: &Digest,
    expected: &CasId,
) -> Result<()> {
    if observed == expected.digest() {
        return Ok(());
    }
    if cas.get_reference(&CasId::new(*observed))?.is_none() {
        return Err(CacheError::Dangling {
            key: key.to_string(),
            value: CasId::new(*observed).to_string(),
            recovery_hint: RecoveryHint::ClearAndRetry,
        });
    }
    Err(poisoned_error(key, observed, expected))
}
