//! Dependency output collection and replay
//!
//! During a cache-miss run the collector gathers every file the compile
//! read and folds them into one CAS object: empty data, one path blob per
//! reference, in first-seen order. The paired replay reinflates the object
//! into makefile-style text at whatever dependency-file path and target
//! names the *current* invocation asks for, so those never enter the key.

use jobcache_cas::{ObjectRef, ObjectStore, Result};
use parking_lot::Mutex;

/// Dependency-scan output mode selected by the scanning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepscanMode {
    #[default]
    Full,
    FullTree,
    FullIncludeTree,
}

impl DepscanMode {
    /// Reads the environment switches the scanning service observes.
    pub fn from_env() -> Self {
        if std::env::var_os("CLANG_CACHE_USE_INCLUDE_TREE").is_some() {
            Self::FullIncludeTree
        } else if std::env::var_os("CLANG_CACHE_USE_CASFS_DEPSCAN").is_some() {
            Self::FullTree
        } else {
            Self::Full
        }
    }
}

/// Accumulates the dependencies a compile touches.
#[derive(Default)]
pub struct DependencyCollector {
    files: Mutex<Vec<String>>,
}

impl DependencyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&self, path: impl Into<String>) {
        let path = path.into();
        let mut files = self.files.lock();
        if !files.contains(&path) {
            files.push(path);
        }
    }

    /// Fold the collected paths into one CAS object.
    pub fn store(&self, cas: &dyn ObjectStore) -> Result<ObjectRef> {
        let files = self.files.lock().clone();
        let refs = files
            .iter()
            .map(|path| cas.store(&[], path.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        cas.store(&refs, b"")
    }
}

/// Reinflate a dependency object into makefile-style text.
pub fn replay_dependencies(
    cas: &dyn ObjectStore,
    deps: ObjectRef,
    targets: &[String],
    out: &mut Vec<u8>,
) -> Result<()> {
    let handle = cas.load(deps)?;
    let mut paths = Vec::with_capacity(handle.num_refs());
    handle.for_each_ref(|reference| {
        let blob = cas.load(reference)?;
        paths.push(String::from_utf8_lossy(blob.data()).into_owned());
        Ok(())
    })?;

    for target in targets {
        out.extend_from_slice(target.as_bytes());
        out.push(b':');
        for path in &paths {
            out.extend_from_slice(b" \\\n  ");
            out.extend_from_slice(path.as_bytes());
        }
        out.push(b'\n');
    }
    Ok(())
}
