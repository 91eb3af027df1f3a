//! Named object trees
//!
//! Groups named outputs under one object: entry metadata (name + kind) is
//! encoded in the tree object's data, with one outgoing reference per entry
//! in the same order. Entries are sorted by name so equal trees hash
//! identically regardless of push order.

use crate::digest::CasId;
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::store::{ObjectHandle, ObjectRef, ObjectStore};

/// What an entry's reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    /// An opaque object (file contents, captured output, ...).
    Regular,
    /// Another tree.
    Tree,
}

impl TreeEntryKind {
    fn encode(self) -> u8 {
        match self {
            Self::Regular => 0,
            Self::Tree => 1,
        }
    }

    fn decode(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Regular),
            1 => Some(Self::Tree),
            _ => None,
        }
    }
}

/// A resolved tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: TreeEntryKind,
    pub reference: ObjectRef,
}

/// Accumulates named entries and writes them as one tree object.
#[derive(Default)]
pub struct TreeBuilder {
    entries: Vec<(String, TreeEntryKind, ObjectRef)>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: TreeEntryKind,
        reference: ObjectRef,
    ) -> &mut Self {
        self.entries.push((name.into(), kind, reference));
        self
    }

    /// Store the tree, returning its loaded proxy.
    pub fn create(&self, cas: &dyn ObjectStore) -> Result<ObjectHandle> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(CacheError::InvalidId {
                    text: pair[0].0.clone(),
                    reason: "duplicate tree entry name".to_string(),
                    recovery_hint: RecoveryHint::NoRecovery,
                });
            }
        }

        let mut data = Vec::new();
        data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        let mut refs = Vec::with_capacity(entries.len());
        for (name, kind, reference) in &entries {
            data.push(kind.encode());
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(name.as_bytes());
            refs.push(*reference);
        }
        cas.create_proxy(&refs, &data)
    }
}

/// A loaded, parsed tree.
pub struct Tree {
    id: CasId,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Load and parse the tree named by `reference`.
    pub fn load(cas: &dyn ObjectStore, reference: ObjectRef) -> Result<Self> {
        let handle = cas.load(reference)?;
        Self::parse(&handle)
    }

    /// Parse an already loaded tree object.
    pub fn parse(handle: &ObjectHandle) -> Result<Self> {
        let id = handle.id();
        let malformed = |reason: &str| {
            CacheError::corruption("<tree object>", format!("tree '{id}': {reason}"))
        };

        let data = handle.data();
        if data.len() < 4 {
            return Err(malformed("missing entry count"));
        }
        let count = u32::from_le_bytes(data[0..4].try_into().expect("entry count width")) as usize;
        if count != handle.num_refs() {
            return Err(malformed("entry count does not match reference count"));
        }

        let mut entries = Vec::with_capacity(count);
        let mut cursor = 4usize;
        for index in 0..count {
            let kind = data
                .get(cursor)
                .copied()
                .and_then(TreeEntryKind::decode)
                .ok_or_else(|| malformed("bad entry kind"))?;
            cursor += 1;
            let name_len = data
                .get(cursor..cursor + 4)
                .map(|b| u32::from_le_bytes(b.try_into().expect("name length width")) as usize)
                .ok_or_else(|| malformed("truncated name length"))?;
            cursor += 4;
            let name = data
                .get(cursor..cursor + name_len)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| malformed("truncated name"))?;
            cursor += name_len;
            entries.push(TreeEntry {
                name,
                kind,
                reference: handle.ref_at(index).ok_or_else(|| malformed("missing ref"))?,
            });
        }
        if cursor != data.len() {
            return Err(malformed("trailing bytes after entries"));
        }
        if entries.windows(2).any(|pair| pair[0].name >= pair[1].name) {
            return Err(malformed("entries are not sorted by unique name"));
        }

        Ok(Self { id, entries })
    }

    pub fn id(&self) -> CasId {
        self.id
    }

    /// Entries are sorted by name.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn lookup(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.entries[index])
    }
}
