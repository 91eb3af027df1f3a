//! On-disk object store backend
//!
//! Two files under the store root: `v1.objects`, a mapped trie keyed by
//! object digest whose payloads are fixed records
//! `{data_offset, data_size, refs_offset, num_refs}`, and
//! `v1.objects.data`, an append-only side file holding raw object bytes and
//! packed reference-digest arrays. Ref arrays store digests rather than file
//! offsets, which keeps the side file position independent; digests resolve
//! back to leaves through the trie on load.

use super::{next_store_id, object_digest, ObjectHandle, ObjectRef, ObjectStore};
use crate::digest::{CasId, Digest, DIGEST_LEN};
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::trie::disk::{DiskTrie, TrieConfig};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const OBJECTS_TABLE_FILE: &str = "v1.objects";
const OBJECTS_DATA_FILE: &str = "v1.objects.data";
const OBJECTS_TABLE_NAME: &str = "llvm.objects[BLAKE3]";
const DATA_MAGIC: &[u8; 8] = b"JCASDATA";

const OBJECT_RECORD_LEN: usize = 32;

struct ObjectRecord {
    data_offset: u64,
    data_size: u64,
    refs_offset: u64,
    num_refs: u64,
}

impl ObjectRecord {
    fn encode(&self) -> [u8; OBJECT_RECORD_LEN] {
        let mut out = [0u8; OBJECT_RECORD_LEN];
        out[0..8].copy_from_slice(&self.data_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.data_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.refs_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.num_refs.to_le_bytes());
        out
    }

    fn decode(payload: &[u8], path: &Path) -> Result<Self> {
        if payload.len() < OBJECT_RECORD_LEN {
            return Err(CacheError::corruption(path, "short object record"));
        }
        let field = |range: std::ops::Range<usize>| {
            u64::from_le_bytes(payload[range].try_into().expect("record field width"))
        };
        Ok(Self {
            data_offset: field(0..8),
            data_size: field(8..16),
            refs_offset: field(16..24),
            num_refs: field(24..32),
        })
    }
}

/// Append-only side file for variable-length object content.
struct DataFile {
    path: PathBuf,
    file: File,
}

impl DataFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::io(&path, "open object data file", e))?;

        file.lock_exclusive()
            .map_err(|e| CacheError::io(&path, "lock object data file", e))?;
        let init = (|| -> Result<()> {
            let len = file
                .metadata()
                .map_err(|e| CacheError::io(&path, "stat object data file", e))?
                .len();
            if len == 0 {
                (&file)
                    .write_all(DATA_MAGIC)
                    .map_err(|e| CacheError::io(&path, "initialize object data file", e))?;
            } else {
                let mut magic = [0u8; 8];
                (&file)
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| (&file).read_exact(&mut magic))
                    .map_err(|e| CacheError::io(&path, "read object data header", e))?;
                if &magic != DATA_MAGIC {
                    return Err(CacheError::corruption(&path, "bad object data magic"));
                }
            }
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        init?;

        Ok(Self { path, file })
    }

    /// Append a span and return its offset. The advisory lock serializes
    /// appends from other processes sharing the file.
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        self.file
            .lock_exclusive()
            .map_err(|e| CacheError::io(&self.path, "lock object data file", e))?;
        let result = (|| -> Result<u64> {
            let offset = self
                .file
                .seek(SeekFrom::End(0))
                .map_err(|e| CacheError::io(&self.path, "seek object data file", e))?;
            self.file
                .write_all(bytes)
                .map_err(|e| CacheError::io(&self.path, "append object data", e))?;
            Ok(offset)
        })();
        let _ = fs2::FileExt::unlock(&self.file);
        result
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut out))
            .map_err(|e| CacheError::io(&self.path, "read object data", e))?;
        Ok(out)
    }
}

/// Persistent CAS backend over a mapped trie plus a data side file.
pub struct OnDiskObjectStore {
    store_id: u64,
    root: PathBuf,
    trie: DiskTrie,
    data: Mutex<DataFile>,
}

impl OnDiskObjectStore {
    /// Open or create a store rooted at `root`.
    pub fn create(root: &Path, config: &TrieConfig) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| CacheError::io(root, "create store directory", e))?;
        let trie = DiskTrie::create(
            &root.join(OBJECTS_TABLE_FILE),
            OBJECTS_TABLE_NAME,
            OBJECT_RECORD_LEN,
            config,
        )?;
        let data = DataFile::open(root.join(OBJECTS_DATA_FILE))?;
        tracing::debug!(root = %root.display(), "opened on-disk object store");
        Ok(Self {
            store_id: next_store_id(),
            root: root.to_path_buf(),
            trie,
            data: Mutex::new(data),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Flush mapped table pages so other processes observe recent stores.
    pub fn flush(&self) -> Result<()> {
        self.trie.flush()
    }

    fn ref_digest(&self, reference: ObjectRef) -> Result<Digest> {
        reference.check_store(self.store_id)?;
        Digest::from_bytes(&self.trie.read_key(reference.index())?)
    }
}

impl ObjectStore for OnDiskObjectStore {
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef> {
        let ref_digests = refs
            .iter()
            .map(|r| self.ref_digest(*r))
            .collect::<Result<Vec<_>>>()?;
        let digest = object_digest(&ref_digests, data);

        let outcome = self.trie.insert_lazy(digest.as_bytes(), |payload| {
            let mut packed = Vec::with_capacity(ref_digests.len() * DIGEST_LEN);
            for ref_digest in &ref_digests {
                packed.extend_from_slice(ref_digest.as_bytes());
            }
            let mut side = self.data.lock();
            let data_offset = side.append(data)?;
            let refs_offset = side.append(&packed)?;
            let record = ObjectRecord {
                data_offset,
                data_size: data.len() as u64,
                refs_offset,
                num_refs: ref_digests.len() as u64,
            };
            payload[..OBJECT_RECORD_LEN].copy_from_slice(&record.encode());
            Ok(())
        })?;
        if outcome.inserted {
            tracing::trace!(id = %digest, bytes = data.len(), refs = refs.len(), "stored object");
        }
        Ok(ObjectRef::new(self.store_id, outcome.record.offset))
    }

    fn load(&self, reference: ObjectRef) -> Result<ObjectHandle> {
        reference.check_store(self.store_id)?;
        let leaf = self.trie.read_leaf(reference.index())?;
        let id = CasId::new(Digest::from_bytes(&self.trie.read_key(reference.index())?)?);
        let record = ObjectRecord::decode(&leaf.payload, self.trie.path())?;

        let (data, packed_refs) = {
            let mut side = self.data.lock();
            let data = side.read_at(record.data_offset, record.data_size as usize)?;
            let packed =
                side.read_at(record.refs_offset, record.num_refs as usize * DIGEST_LEN)?;
            (data, packed)
        };

        let mut refs = Vec::with_capacity(record.num_refs as usize);
        for chunk in packed_refs.chunks_exact(DIGEST_LEN) {
            let digest = Digest::from_bytes(chunk)?;
            let leaf = self.trie.find(digest.as_bytes())?.ok_or_else(|| {
                CacheError::corruption(
                    self.trie.path(),
                    format!("object '{id}' references unknown digest '{digest}'"),
                )
            })?;
            refs.push(ObjectRef::new(self.store_id, leaf.offset));
        }

        Ok(ObjectHandle::new(
            reference,
            id,
            Arc::from(data),
            Arc::from(refs),
        ))
    }

    fn get_reference(&self, id: &CasId) -> Result<Option<ObjectRef>> {
        Ok(self
            .trie
            .find(id.digest().as_bytes())?
            .map(|leaf| ObjectRef::new(self.store_id, leaf.offset)))
    }

    fn get_id(&self, reference: ObjectRef) -> Result<CasId> {
        Ok(CasId::new(self.ref_digest(reference)?))
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
            .map(|r| self.ref_digest(r))
            .collect::<Result<Vec<_>>>()?;
        let recomputed = object_digest(&ref_digests, handle.data());
        if &recomputed == id.digest() {
            Ok(())
        } else {
            Err(CacheError::corruption(
                self.trie.path(),
                format!("object '{id}' hashes to '{recomputed}'"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> OnDiskObjectStore {
        OnDiskObjectStore::create(
            dir.path(),
            &TrieConfig {
                min_file_size: 4096,
                max_file_size: 64 * 1024 * 1024,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let leaf = store.store(&[], b"leaf data").unwrap();
        let node = store.store(&[leaf, leaf], b"node data").unwrap();

        let handle = store.load(node).unwrap();
        assert_eq!(handle.data(), b"node data");
        assert_eq!(handle.num_refs(), 2);
        assert_eq!(handle.ref_at(0), Some(leaf));
        assert_eq!(handle.ref_at(1), Some(leaf));
    }

    #[test]
    fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let first = store.store(&[], b"same").unwrap();
        let second = store.store(&[], b"same").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ids_match_in_memory_backend() {
        use crate::store::memory::InMemoryObjectStore;

        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        let memory = InMemoryObjectStore::new();

        let disk_leaf = disk.store(&[], b"shared").unwrap();
        let memory_leaf = memory.store(&[], b"shared").unwrap();
        assert_eq!(
            disk.get_id(disk_leaf).unwrap(),
            memory.get_id(memory_leaf).unwrap()
        );

        let disk_node = disk.store(&[disk_leaf], b"parent").unwrap();
        let memory_node = memory.store(&[memory_leaf], b"parent").unwrap();
        assert_eq!(
            disk.get_id(disk_node).unwrap(),
            memory.get_id(memory_node).unwrap()
        );
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open(&dir);
            let leaf = store.store(&[], b"inner").unwrap();
            let node = store.store(&[leaf], b"outer").unwrap();
            store.flush().unwrap();
            store.get_id(node).unwrap()
        };

        let store = open(&dir);
        let reference = store.get_reference(&id).unwrap().expect("persisted");
        let handle = store.load(reference).unwrap();
        assert_eq!(handle.data(), b"outer");
        assert_eq!(handle.num_refs(), 1);
        let inner = store.load(handle.ref_at(0).unwrap()).unwrap();
        assert_eq!(inner.data(), b"inner");
        store.validate(&id).unwrap();
    }

    #[test]
    fn test_cross_store_reference_is_rejected() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open(&dir_a);
        let b = open(&dir_b);

        let in_a = a.store(&[], b"1").unwrap();
        let err = b.load(in_a).unwrap_err();
        assert!(matches!(err, CacheError::ConfigMismatch { .. }), "{err}");
    }

    #[test]
    fn test_unknown_id_has_no_reference() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let id = CasId::new(Digest::compute(b"never stored as an object"));
        assert_eq!(store.get_reference(&id).unwrap(), None);
    }

    #[test]
    fn test_many_objects() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ids: Vec<_> = (0..256u32)
            .map(|i| {
                let data = format!("object {i}");
                let r = store.store(&[], data.as_bytes()).unwrap();
                (store.get_id(r).unwrap(), data)
            })
            .collect();
        for (id, data) in ids {
            let r = store.get_reference(&id).unwrap().unwrap();
            assert_eq!(store.load(r).unwrap().data(), data.as_bytes());
        }
    }
}
