//! Content-addressed storage and action caching
//!
//! This crate provides the substrate a compile-job result cache sits on:
//! - an object model of immutable `(refs, data)` nodes named by BLAKE3
//!   digests, with in-memory and on-disk backends
//! - the hash-indexed trie both backends share, including the append-only
//!   memory-mapped table format used on disk
//! - an action cache binding action keys to result objects, with
//!   insert-or-verify semantics that surface cache poisoning
//! - named object trees for grouping outputs

pub mod action;
pub mod digest;
pub mod errors;
pub mod store;
pub mod tree;
pub mod trie;

pub use action::{
    ActionCache, InMemoryActionCache, MapEntry, OnDiskActionCache, RemoteActionCache,
    RemoteCacheBackend, ACTION_CACHE_TABLE_NAME,
};
pub use digest::{CasId, Digest, DigestHasher, DIGEST_LEN, HASH_SCHEME};
pub use errors::{CacheError, RecoveryHint, Result};
pub use store::{
    object_digest, InMemoryObjectStore, ObjectHandle, ObjectRef, ObjectStore, OnDiskObjectStore,
};
pub use tree::{Tree, TreeBuilder, TreeEntry, TreeEntryKind};
pub use trie::disk::TrieConfig;
