//! Memory-mapped on-disk hash-indexed trie
//!
//! A single append-only table file holds a fixed header, 64-slot internal
//! nodes, and leaves (full key + fixed-size payload). Slots are 64-bit
//! little-endian file offsets with a tag in the low bits, so the file is
//! position independent and can be mapped by several processes at once.
//!
//! Concurrency contract: lookups only perform acquire loads of slot words.
//! At most one writer extends the file at a time; allocation is guarded by
//! an OS-advisory lock on the table file (plus an in-process mutex, since
//! advisory locks do not exclude threads sharing the descriptor). A new leaf
//! or node is fully initialized before its parent slot is published with an
//! atomic release store, so readers observe either the old slot value or a
//! complete record, never a torn one.

use super::{slot_index, FANOUT, KEY_BITS, MAX_LEVELS};
use crate::digest::{DIGEST_LEN, HASH_SCHEME};
use crate::errors::{CacheError, RecoveryHint, Result};
use fs2::FileExt;
use memmap2::MmapRaw;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// "JCAS" in little-endian byte order.
const TABLE_MAGIC: u32 = 0x4a43_4153;
const TABLE_VERSION: u16 = 1;

const HEADER_LEN: u64 = 128;
const NODE_SIZE: u64 = (FANOUT * 8) as u64;
const ROOT_OFFSET: u64 = HEADER_LEN;
const FIRST_ALLOC: u64 = HEADER_LEN + NODE_SIZE;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const CRC_OFFSET: usize = 8;
const KEY_BITS_OFFSET: usize = 12;
const PAYLOAD_BYTES_OFFSET: usize = 16;
const ROOT_OFFSET_OFFSET: usize = 24;
const WATERMARK_OFFSET: usize = 32;
const TABLE_NAME_OFFSET: usize = 40;
const TABLE_NAME_LEN: usize = 64;

const TAG_MASK: u64 = 0b11;
const TAG_BRANCH: u64 = 0b01;
const TAG_LEAF: u64 = 0b10;

/// Sizing bounds for a table file.
#[derive(Debug, Clone)]
pub struct TrieConfig {
    /// Initial file size; the file is created at this length.
    pub min_file_size: u64,
    /// Hard cap; allocation past this point is a [`CacheError::TableFull`].
    pub max_file_size: u64,
}

impl Default for TrieConfig {
    fn default() -> Self {
        const MB: u64 = 1024 * 1024;
        const GB: u64 = 1024 * MB;
        Self {
            min_file_size: MB,
            max_file_size: GB,
        }
    }
}

/// A resident leaf: its file offset (stable for the life of the table) and
/// a copy of its payload.
#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Outcome of [`DiskTrie::insert_lazy`].
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub record: LeafRecord,
    pub inserted: bool,
}

enum FindStep {
    Found(LeafRecord),
    Missing,
    /// A slot pointed past the mapped range: the file grew under another
    /// process and our mapping is stale.
    StaleMapping,
}

/// Concurrent, persistent trie over one memory-mapped table file.
#[derive(Debug)]
pub struct DiskTrie {
    path: PathBuf,
    file: File,
    map: RwLock<MmapRaw>,
    alloc_lock: Mutex<()>,
    payload_bytes: usize,
    leaf_size: u64,
    max_file_size: u64,
}

impl DiskTrie {
    /// Open or create the table file at `path`.
    ///
    /// An existing file must carry a matching header (magic, version, hash
    /// scheme, key width, payload size, table name); anything else is
    /// reported as corruption.
    pub fn create(
        path: &Path,
        table_name: &str,
        payload_bytes: usize,
        config: &TrieConfig,
    ) -> Result<Self> {
        if table_name.len() > TABLE_NAME_LEN {
            return Err(CacheError::ConfigMismatch {
                reason: format!("table name '{table_name}' exceeds {TABLE_NAME_LEN} bytes"),
                recovery_hint: RecoveryHint::NoRecovery,
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::io(parent, "create table directory", e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::io(path, "open table file", e))?;

        // Serialize initialization against other processes opening the same
        // table for the first time.
        let _lock = FileLockGuard::acquire(&file, path)?;

        let leaf_size = leaf_size_for(payload_bytes);
        let len = file
            .metadata()
            .map_err(|e| CacheError::io(path, "stat table file", e))?
            .len();

        if len < HEADER_LEN {
            let initial = config.min_file_size.max(FIRST_ALLOC);
            file.set_len(initial)
                .map_err(|e| CacheError::io(path, "size new table file", e))?;
            let map = map_file(&file, path)?;
            let header = encode_header(table_name, payload_bytes);
            // Fresh file: the root node region is already zero.
            unsafe { write_bytes(&map, 0, &header) };
            atomic_at(&map, WATERMARK_OFFSET as u64).store(FIRST_ALLOC, Ordering::Release);
            map.flush()
                .map_err(|e| CacheError::io(path, "flush table header", e))?;
            tracing::debug!(path = %path.display(), table = table_name, "created trie table");
            drop(_lock);
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                map: RwLock::new(map),
                alloc_lock: Mutex::new(()),
                payload_bytes,
                leaf_size,
                max_file_size: config.max_file_size.max(FIRST_ALLOC),
            });
        }

        let map = map_file(&file, path)?;
        validate_header(&map, path, table_name, payload_bytes, len)?;
        tracing::debug!(path = %path.display(), table = table_name, "opened trie table");
        drop(_lock);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: RwLock::new(map),
            alloc_lock: Mutex::new(()),
            payload_bytes,
            leaf_size,
            max_file_size: config.max_file_size.max(len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Read-only lookup; never mutates the table.
    pub fn find(&self, key: &[u8; DIGEST_LEN]) -> Result<Option<LeafRecord>> {
        for _ in 0..2 {
            match self.find_step(key)? {
                FindStep::Found(record) => return Ok(Some(record)),
                FindStep::Missing => return Ok(None),
                FindStep::StaleMapping => self.refresh_mapping()?,
            }
        }
        Err(CacheError::corruption(
            &self.path,
            "slot offset beyond file bounds after remap",
        ))
    }

    /// Insert-or-return-existing.
    ///
    /// When `key` is absent the payload is allocated in the file and
    /// `ctor` is invoked exactly once to initialize it in place before the
    /// slot is published; racing callers converge on the winner's payload
    /// without running their constructors. A failed constructor abandons the
    /// allocation and publishes nothing.
    pub fn insert_lazy<F>(&self, key: &[u8; DIGEST_LEN], ctor: F) -> Result<InsertOutcome>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        if let Some(record) = self.find(key)? {
            return Ok(InsertOutcome {
                record,
                inserted: false,
            });
        }

        let _alloc = self.alloc_lock.lock();
        let _lock = FileLockGuard::acquire(&self.file, &self.path)?;
        // Another process may have extended the file before we took the lock.
        self.refresh_mapping()?;

        let mut node_off = ROOT_OFFSET;
        let mut level = 0usize;
        loop {
            if level >= MAX_LEVELS {
                return Err(CacheError::corruption(
                    &self.path,
                    "trie deeper than the key width permits",
                ));
            }
            let slot_off = node_off + (slot_index(key, level) as u64) * 8;
            let raw = {
                let map = self.map.read();
                self.check_bounds(&map, slot_off, 8)?;
                atomic_at(&map, slot_off).load(Ordering::Acquire)
            };

            if raw == 0 {
                let leaf_off = self.allocate(self.leaf_size)?;
                {
                    let map = self.map.read();
                    unsafe {
                        write_bytes(&map, leaf_off, key);
                        // The region is unpublished; we are the only writer.
                        let payload = std::slice::from_raw_parts_mut(
                            map.as_mut_ptr().add((leaf_off + DIGEST_LEN as u64) as usize),
                            self.payload_bytes,
                        );
                        ctor(payload)?;
                    }
                    atomic_at(&map, slot_off).store(leaf_off | TAG_LEAF, Ordering::Release);
                }
                let record = self.read_leaf(leaf_off)?;
                return Ok(InsertOutcome {
                    record,
                    inserted: true,
                });
            }

            match raw & TAG_MASK {
                TAG_LEAF => {
                    let leaf_off = raw & !TAG_MASK;
                    let existing_key = self.read_key(leaf_off)?;
                    if &existing_key == key {
                        let record = self.read_leaf(leaf_off)?;
                        return Ok(InsertOutcome {
                            record,
                            inserted: false,
                        });
                    }
                    // Prefix collision: sink the resident leaf into a fresh
                    // branch node, publish the branch, and retry from it.
                    let branch_off = self.allocate(NODE_SIZE)?;
                    let map = self.map.read();
                    unsafe { write_bytes(&map, branch_off, &[0u8; NODE_SIZE as usize]) };
                    let child_slot =
                        branch_off + (slot_index(&existing_key, level + 1) as u64) * 8;
                    atomic_at(&map, child_slot).store(raw, Ordering::Relaxed);
                    atomic_at(&map, slot_off).store(branch_off | TAG_BRANCH, Ordering::Release);
                    node_off = branch_off;
                    level += 1;
                }
                TAG_BRANCH => {
                    node_off = raw & !TAG_MASK;
                    level += 1;
                }
                _ => {
                    return Err(CacheError::corruption(
                        &self.path,
                        format!("impossible slot tag {:#x} at offset {slot_off}", raw),
                    ));
                }
            }
        }
    }

    /// Flush mapped pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.map
            .read()
            .flush()
            .map_err(|e| CacheError::io(&self.path, "flush table file", e))
    }

    fn find_step(&self, key: &[u8; DIGEST_LEN]) -> Result<FindStep> {
        let map = self.map.read();
        let mut node_off = ROOT_OFFSET;
        for level in 0..MAX_LEVELS {
            let slot_off = node_off + (slot_index(key, level) as u64) * 8;
            if !in_bounds(&map, slot_off, 8) {
                return Ok(FindStep::StaleMapping);
            }
            let raw = atomic_at(&map, slot_off).load(Ordering::Acquire);
            if raw == 0 {
                return Ok(FindStep::Missing);
            }
            match raw & TAG_MASK {
                TAG_LEAF => {
                    let leaf_off = raw & !TAG_MASK;
                    if !in_bounds(&map, leaf_off, self.leaf_size) {
                        return Ok(FindStep::StaleMapping);
                    }
                    let mut existing_key = [0u8; DIGEST_LEN];
                    unsafe { read_bytes(&map, leaf_off, &mut existing_key) };
                    if &existing_key != key {
                        return Ok(FindStep::Missing);
                    }
                    let mut payload = vec![0u8; self.payload_bytes];
                    unsafe { read_bytes(&map, leaf_off + DIGEST_LEN as u64, &mut payload) };
                    return Ok(FindStep::Found(LeafRecord {
                        offset: leaf_off,
                        payload,
                    }));
                }
                TAG_BRANCH => node_off = raw & !TAG_MASK,
                _ => {
                    return Err(CacheError::corruption(
                        &self.path,
                        format!("impossible slot tag {:#x} at offset {slot_off}", raw),
                    ));
                }
            }
        }
        Ok(FindStep::Missing)
    }

    /// Read a leaf's key + payload by its stable file offset.
    pub fn read_leaf(&self, leaf_off: u64) -> Result<LeafRecord> {
        let map = self.map.read();
        if !in_bounds(&map, leaf_off, self.leaf_size) {
            drop(map);
            self.refresh_mapping()?;
            return self.read_leaf_current(leaf_off);
        }
        let mut payload = vec![0u8; self.payload_bytes];
        unsafe { read_bytes(&map, leaf_off + DIGEST_LEN as u64, &mut payload) };
        Ok(LeafRecord {
            offset: leaf_off,
            payload,
        })
    }

    /// Read a leaf's full key by its stable file offset.
    pub fn read_key(&self, leaf_off: u64) -> Result<[u8; DIGEST_LEN]> {
        {
            let map = self.map.read();
            if in_bounds(&map, leaf_off, self.leaf_size) {
                let mut key = [0u8; DIGEST_LEN];
                unsafe { read_bytes(&map, leaf_off, &mut key) };
                return Ok(key);
            }
        }
        self.refresh_mapping()?;
        let map = self.map.read();
        self.check_bounds(&map, leaf_off, self.leaf_size)?;
        let mut key = [0u8; DIGEST_LEN];
        unsafe { read_bytes(&map, leaf_off, &mut key) };
        Ok(key)
    }

    fn read_leaf_current(&self, leaf_off: u64) -> Result<LeafRecord> {
        let map = self.map.read();
        self.check_bounds(&map, leaf_off, self.leaf_size)?;
        let mut payload = vec![0u8; self.payload_bytes];
        unsafe { read_bytes(&map, leaf_off + DIGEST_LEN as u64, &mut payload) };
        Ok(LeafRecord {
            offset: leaf_off,
            payload,
        })
    }

    /// Allocate `size` bytes past the high watermark, growing the file as
    /// needed. Caller must hold the allocation locks.
    fn allocate(&self, size: u64) -> Result<u64> {
        debug_assert_eq!(size % 8, 0);
        let watermark = {
            let map = self.map.read();
            atomic_at(&map, WATERMARK_OFFSET as u64).load(Ordering::Acquire)
        };
        let end = watermark
            .checked_add(size)
            .ok_or_else(|| CacheError::corruption(&self.path, "high watermark overflow"))?;

        if end > self.map.read().len() as u64 {
            if end > self.max_file_size {
                return Err(CacheError::TableFull {
                    path: self.path.clone(),
                    capacity: self.max_file_size,
                    recovery_hint: RecoveryHint::IncreaseCapacity {
                        suggested_bytes: self.max_file_size * 2,
                    },
                });
            }
            let current = self.map.read().len() as u64;
            let new_len = (current * 2).max(end).min(self.max_file_size);
            self.file
                .set_len(new_len)
                .map_err(|e| CacheError::io(&self.path, "grow table file", e))?;
            let mut map = self.map.write();
            *map = map_file(&self.file, &self.path)?;
            tracing::debug!(path = %self.path.display(), new_len, "grew trie table");
        }

        let map = self.map.read();
        atomic_at(&map, WATERMARK_OFFSET as u64).store(end, Ordering::Release);
        Ok(watermark)
    }

    fn refresh_mapping(&self) -> Result<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| CacheError::io(&self.path, "stat table file", e))?
            .len();
        let mut map = self.map.write();
        if len > map.len() as u64 {
            *map = map_file(&self.file, &self.path)?;
        }
        Ok(())
    }

    fn check_bounds(&self, map: &MmapRaw, off: u64, len: u64) -> Result<()> {
        if in_bounds(map, off, len) {
            Ok(())
        } else {
            Err(CacheError::corruption(
                &self.path,
                format!("offset {off}+{len} beyond mapped length {}", map.len()),
            ))
        }
    }
}

struct FileLockGuard<'a>(&'a File);

impl<'a> FileLockGuard<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self> {
        file.lock_exclusive()
            .map_err(|e| CacheError::io(path, "lock table file", e))?;
        Ok(Self(file))
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(self.0);
    }
}

fn leaf_size_for(payload_bytes: usize) -> u64 {
    let raw = DIGEST_LEN as u64 + payload_bytes as u64;
    raw.div_ceil(8) * 8
}

fn map_file(file: &File, path: &Path) -> Result<MmapRaw> {
    MmapRaw::map_raw(file).map_err(|e| CacheError::io(path, "memory map table file", e))
}

fn in_bounds(map: &MmapRaw, off: u64, len: u64) -> bool {
    off % 8 == 0 && off.checked_add(len).is_some_and(|end| end <= map.len() as u64)
}

/// View an 8-aligned mapped word as an atomic.
///
/// Sound because the mapping is page aligned, offsets stay 8-aligned, and
/// all concurrent access to slot words goes through atomics.
fn atomic_at(map: &MmapRaw, off: u64) -> &AtomicU64 {
    debug_assert!(off % 8 == 0 && off + 8 <= map.len() as u64);
    unsafe { &*(map.as_ptr().add(off as usize) as *const AtomicU64) }
}

/// Copy bytes into the mapping. Caller guarantees the region is in bounds
/// and not concurrently accessed (unpublished, or covered by a lock).
unsafe fn write_bytes(map: &MmapRaw, off: u64, bytes: &[u8]) {
    debug_assert!(off + bytes.len() as u64 <= map.len() as u64);
    std::ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        map.as_mut_ptr().add(off as usize),
        bytes.len(),
    );
}

/// Copy bytes out of the mapping. Caller guarantees bounds.
unsafe fn read_bytes(map: &MmapRaw, off: u64, out: &mut [u8]) {
    debug_assert!(off + out.len() as u64 <= map.len() as u64);
    std::ptr::copy_nonoverlapping(
        map.as_ptr().add(off as usize),
        out.as_mut_ptr(),
        out.len(),
    );
}

fn encode_header(table_name: &str, payload_bytes: usize) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
    header[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&TABLE_VERSION.to_le_bytes());
    header[KEY_BITS_OFFSET..KEY_BITS_OFFSET + 4].copy_from_slice(&(KEY_BITS as u32).to_le_bytes());
    header[PAYLOAD_BYTES_OFFSET..PAYLOAD_BYTES_OFFSET + 4]
        .copy_from_slice(&(payload_bytes as u32).to_le_bytes());
    header[ROOT_OFFSET_OFFSET..ROOT_OFFSET_OFFSET + 8].copy_from_slice(&ROOT_OFFSET.to_le_bytes());
    header[TABLE_NAME_OFFSET..TABLE_NAME_OFFSET + table_name.len()]
        .copy_from_slice(table_name.as_bytes());
    let crc = header_crc(&header);
    header[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    header
}

/// CRC32C over the header with the CRC field and the mutable high-watermark
/// word zeroed.
fn header_crc(header: &[u8; HEADER_LEN as usize]) -> u32 {
    let mut copy = *header;
    copy[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
    copy[WATERMARK_OFFSET..WATERMARK_OFFSET + 8].fill(0);
    crc32c::crc32c(&copy)
}

fn validate_header(
    map: &MmapRaw,
    path: &Path,
    table_name: &str,
    payload_bytes: usize,
    file_len: u64,
) -> Result<()> {
    if (map.len() as u64) < HEADER_LEN {
        return Err(CacheError::corruption(path, "file shorter than header"));
    }
    let mut header = [0u8; HEADER_LEN as usize];
    unsafe { read_bytes(map, 0, &mut header) };

    let field_u32 = |off: usize| u32::from_le_bytes(header[off..off + 4].try_into().unwrap());
    let field_u64 = |off: usize| u64::from_le_bytes(header[off..off + 8].try_into().unwrap());

    let magic = field_u32(MAGIC_OFFSET);
    if magic != TABLE_MAGIC {
        return Err(CacheError::corruption(
            path,
            format!("bad magic: expected {TABLE_MAGIC:#010x}, got {magic:#010x}"),
        ));
    }
    let version = u16::from_le_bytes(header[VERSION_OFFSET..VERSION_OFFSET + 2].try_into().unwrap());
    if version != TABLE_VERSION {
        return Err(CacheError::corruption(
            path,
            format!("unsupported table version {version}"),
        ));
    }
    let stored_crc = field_u32(CRC_OFFSET);
    let expected_crc = header_crc(&header);
    if stored_crc != expected_crc {
        return Err(CacheError::corruption(
            path,
            format!("header CRC mismatch: expected {expected_crc:#010x}, got {stored_crc:#010x}"),
        ));
    }
    let key_bits = field_u32(KEY_BITS_OFFSET);
    if key_bits as usize != KEY_BITS {
        return Err(CacheError::corruption(
            path,
            format!("key width {key_bits} does not match {HASH_SCHEME} ({KEY_BITS} bits)"),
        ));
    }
    let stored_payload = field_u32(PAYLOAD_BYTES_OFFSET);
    if stored_payload as usize != payload_bytes {
        return Err(CacheError::corruption(
            path,
            format!("payload size {stored_payload} does not match expected {payload_bytes}"),
        ));
    }
    if field_u64(ROOT_OFFSET_OFFSET) != ROOT_OFFSET {
        return Err(CacheError::corruption(path, "unexpected root offset"));
    }
    let mut name = [0u8; TABLE_NAME_LEN];
    name.copy_from_slice(&header[TABLE_NAME_OFFSET..TABLE_NAME_OFFSET + TABLE_NAME_LEN]);
    let stored_name = name.split(|b| *b == 0).next().unwrap_or(&[]);
    if stored_name != table_name.as_bytes() {
        return Err(CacheError::corruption(
            path,
            format!(
                "table name mismatch: expected '{table_name}', got '{}'",
                String::from_utf8_lossy(stored_name)
            ),
        ));
    }
    let watermark = field_u64(WATERMARK_OFFSET);
    if watermark < FIRST_ALLOC || watermark > file_len {
        return Err(CacheError::corruption(
            path,
            format!("high watermark {watermark} outside file bounds"),
        ));
    }
    Ok(())
}
