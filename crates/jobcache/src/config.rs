//! CAS configuration for compile jobs
//!
//! The configuration is extracted from the invocation and frozen before the
//! compiler runs. A frozen configuration hides the storage location from
//! everything downstream, so a cache path can never leak into diagnostics
//! or captured outputs and perturb the action key.

use jobcache_cas::{
    ActionCache, InMemoryActionCache, InMemoryObjectStore, ObjectStore, OnDiskActionCache,
    OnDiskObjectStore, Result, TrieConfig,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the CAS and action cache live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CasOptions {
    /// Directory holding the `v1.*` table files; in-memory when unset.
    pub on_disk_root: Option<PathBuf>,
    /// Initial table file size override.
    #[serde(default)]
    pub min_table_size: Option<u64>,
    /// Maximum table file size override.
    #[serde(default)]
    pub max_table_size: Option<u64>,
}

impl CasOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self {
            on_disk_root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Freeze the configuration, hiding the location behind an opaque
    /// handle.
    pub fn freeze(self) -> FrozenCasOptions {
        FrozenCasOptions { inner: self }
    }
}

/// An opaque, frozen CAS configuration.
pub struct FrozenCasOptions {
    inner: CasOptions,
}

impl fmt::Debug for FrozenCasOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The location stays hidden once frozen.
        f.write_str("FrozenCasOptions(..)")
    }
}

impl FrozenCasOptions {
    fn trie_config(&self) -> TrieConfig {
        let defaults = TrieConfig::default();
        TrieConfig {
            min_file_size: self.inner.min_table_size.unwrap_or(defaults.min_file_size),
            max_file_size: self.inner.max_table_size.unwrap_or(defaults.max_file_size),
        }
    }

    /// Construct the object store and its paired action cache.
    pub fn create_stores(&self) -> Result<(Arc<dyn ObjectStore>, Arc<dyn ActionCache>)> {
        match &self.inner.on_disk_root {
            None => {
                let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
                let cache: Arc<dyn ActionCache> = Arc::new(InMemoryActionCache::new(cas.clone()));
                Ok((cas, cache))
            }
            Some(root) => {
                let config = self.trie_config();
                let cas: Arc<dyn ObjectStore> =
                    Arc::new(OnDiskObjectStore::create(root, &config)?);
                let cache: Arc<dyn ActionCache> =
                    Arc::new(OnDiskActionCache::create(cas.clone(), root, &config)?);
                Ok((cas, cache))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_frozen_options_hide_the_location() {
        let frozen = CasOptions::on_disk("/secret/cache/path").freeze();
        let rendered = format!("{frozen:?}");
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_in_memory_stores() {
        let (cas, cache) = CasOptions::in_memory().freeze().create_stores().unwrap();
        let proxy = cas.create_proxy(&[], b"x").unwrap();
        cache.put(&proxy.id(), proxy.reference()).unwrap();
        assert_eq!(cache.get(&proxy.id()).unwrap(), Some(proxy.reference()));
    }

    #[test]
    fn test_on_disk_stores_share_a_root() {
        let dir = TempDir::new().unwrap();
        let (cas, cache) = CasOptions::on_disk(dir.path()).freeze().create_stores().unwrap();
        let proxy = cas.create_proxy(&[], b"x").unwrap();
        cache.put(&proxy.id(), proxy.reference()).unwrap();

        assert!(dir.path().join("v1.objects").exists());
        assert!(dir.path().join("v1.actions").exists());
    }
}
