//! Output backends
//!
//! A virtual filesystem sink for compiler outputs. Files are buffered until
//! `keep()`; `discard()` drops them without a trace. The capturing backend
//! folds kept files into CAS objects as interleaved `[name, bytes, ...]`
//! reference pairs, remapping configured paths to their symbolic kind names
//! so result trees stay independent of concrete output locations. The
//! mirroring combinator tees every file to a second backend, which is how a
//! cache-miss run streams outputs to disk while capturing them.

use crate::atomic_file::write_atomic;
use jobcache_cas::{CacheError, ObjectHandle, ObjectRef, ObjectStore, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-file output options.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Write through a temp file and rename.
    pub atomic_write: bool,
    /// Create missing parent directories on keep.
    pub create_directories: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            atomic_write: true,
            create_directories: true,
        }
    }
}

/// An open output file. Dropping without `keep()` discards the content.
pub trait OutputFile: Write + Send {
    fn path(&self) -> &Path;

    /// Commit the buffered content.
    fn keep(self: Box<Self>) -> Result<()>;

    /// Drop the buffered content.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// A sink that produces output files.
pub trait OutputBackend: Send + Sync {
    fn create_file(&self, path: &Path, config: &OutputConfig) -> Result<Box<dyn OutputFile>>;
}

#[derive(Default)]
struct CaptureState {
    refs: Vec<ObjectRef>,
    kind_maps: Vec<(String, String)>,
}

impl CaptureState {
    /// The symbolic kind name for `path` if one was registered, otherwise
    /// the path itself.
    fn remap_path<'a>(&'a self, path: &'a str) -> &'a str {
        self.kind_maps
            .iter()
            .find(|(_, mapped)| mapped == path)
            .map(|(kind, _)| kind.as_str())
            .unwrap_or(path)
    }
}

/// Backend that stores kept outputs in the CAS.
#[derive(Clone)]
pub struct CapturingOutputBackend {
    cas: Arc<dyn ObjectStore>,
    state: Arc<Mutex<CaptureState>>,
}

impl CapturingOutputBackend {
    pub fn new(cas: Arc<dyn ObjectStore>) -> Self {
        Self {
            cas,
            state: Arc::new(Mutex::new(CaptureState::default())),
        }
    }

    /// Register a path→kind substitution applied when files are kept.
    pub fn add_kind_map(&self, kind: impl Into<String>, path: impl Into<String>) {
        self.state
            .lock()
            .kind_maps
            .push((kind.into(), path.into()));
    }

    /// Append an already stored object under `name` (remapped like a path).
    pub fn add_object(&self, name: &str, object: ObjectRef) -> Result<()> {
        let mut state = self.state.lock();
        let name = state.remap_path(name).to_string();
        let name_ref = self.cas.store(&[], name.as_bytes())?;
        state.refs.push(name_ref);
        state.refs.push(object);
        Ok(())
    }

    /// Finalize: an object whose refs are the accumulated
    /// `[name, bytes, ...]` pairs. Resets the accumulator.
    pub fn into_cas_object(&self) -> Result<ObjectHandle> {
        let refs = std::mem::take(&mut self.state.lock().refs);
        self.cas.create_proxy(&refs, b"")
    }
}

impl OutputBackend for CapturingOutputBackend {
    fn create_file(&self, path: &Path, _config: &OutputConfig) -> Result<Box<dyn OutputFile>> {
        Ok(Box::new(CapturedFile {
            path: path.to_path_buf(),
            bytes: Vec::new(),
            cas: Arc::clone(&self.cas),
            state: Arc::clone(&self.state),
        }))
    }
}

struct CapturedFile {
    path: PathBuf,
    bytes: Vec<u8>,
    cas: Arc<dyn ObjectStore>,
    state: Arc<Mutex<CaptureState>>,
}

impl Write for CapturedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl OutputFile for CapturedFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(self: Box<Self>) -> Result<()> {
        let path = self.path.to_string_lossy();
        let mut state = self.state.lock();
        let name = state.remap_path(&path).to_string();
        let name_ref = self.cas.store(&[], name.as_bytes())?;
        let bytes_ref = self.cas.store(&[], &self.bytes)?;
        state.refs.push(name_ref);
        state.refs.push(bytes_ref);
        tracing::trace!(path = %self.path.display(), name = %name, bytes = self.bytes.len(), "captured output");
        Ok(())
    }

    fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Backend writing kept files to the real filesystem.
#[derive(Debug, Clone, Default)]
pub struct OnDiskOutputBackend;

impl OnDiskOutputBackend {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for OnDiskOutputBackend {
    fn create_file(&self, path: &Path, config: &OutputConfig) -> Result<Box<dyn OutputFile>> {
        Ok(Box::new(DiskOutputFile {
            path: path.to_path_buf(),
            config: config.clone(),
            bytes: Vec::new(),
        }))
    }
}

struct DiskOutputFile {
    path: PathBuf,
    config: OutputConfig,
    bytes: Vec<u8>,
}

impl Write for DiskOutputFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl OutputFile for DiskOutputFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(self: Box<Self>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if self.config.create_directories {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CacheError::io(parent, "create output directory", e))?;
            }
        }
        if self.config.atomic_write {
            write_atomic(&self.path, &self.bytes)
        } else {
            std::fs::write(&self.path, &self.bytes)
                .map_err(|e| CacheError::io(&self.path, "write output file", e))
        }
    }

    fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Tee every file to two backends.
pub struct MirroringOutputBackend {
    primary: Arc<dyn OutputBackend>,
    secondary: Arc<dyn OutputBackend>,
}

impl MirroringOutputBackend {
    pub fn new(primary: Arc<dyn OutputBackend>, secondary: Arc<dyn OutputBackend>) -> Self {
        Self { primary, secondary }
    }
}

impl OutputBackend for MirroringOutputBackend {
    fn create_file(&self, path: &Path, config: &OutputConfig) -> Result<Box<dyn OutputFile>> {
        Ok(Box::new(MirrorFile {
            primary: self.primary.create_file(path, config)?,
            secondary: self.secondary.create_file(path, config)?,
        }))
    }
}

struct MirrorFile {
    primary: Box<dyn OutputFile>,
    secondary: Box<dyn OutputFile>,
}

impl Write for MirrorFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

impl OutputFile for MirrorFile {
    fn path(&self) -> &Path {
        self.primary.path()
    }

    fn keep(self: Box<Self>) -> Result<()> {
        self.primary.keep()?;
        self.secondary.keep()
    }

    fn discard(self: Box<Self>) -> Result<()> {
        self.primary.discard()?;
        self.secondary.discard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcache_cas::InMemoryObjectStore;
    use tempfile::TempDir;

    fn capture_pairs(cas: &dyn ObjectStore, outputs: &ObjectHandle) -> Vec<(String, Vec<u8>)> {
        assert_eq!(outputs.num_refs() % 2, 0, "refs must interleave evenly");
        (0..outputs.num_refs())
            .step_by(2)
            .map(|i| {
                let name = cas.load(outputs.ref_at(i).unwrap()).unwrap();
                let bytes = cas.load(outputs.ref_at(i + 1).unwrap()).unwrap();
                (
                    String::from_utf8(name.data().to_vec()).unwrap(),
                    bytes.data().to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn test_kept_files_become_name_bytes_pairs() {
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let backend = CapturingOutputBackend::new(cas.clone());

        let mut file = backend
            .create_file(Path::new("out/main.o"), &OutputConfig::default())
            .unwrap();
        file.write_all(b"object code").unwrap();
        file.keep().unwrap();

        let outputs = backend.into_cas_object().unwrap();
        let pairs = capture_pairs(cas.as_ref(), &outputs);
        assert_eq!(
            pairs,
            vec![("out/main.o".to_string(), b"object code".to_vec())]
        );
    }

    #[test]
    fn test_discarded_files_leave_no_refs() {
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let backend = CapturingOutputBackend::new(cas.clone());

        let mut file = backend
            .create_file(Path::new("dropped.o"), &OutputConfig::default())
            .unwrap();
        file.write_all(b"never kept").unwrap();
        file.discard().unwrap();

        let outputs = backend.into_cas_object().unwrap();
        assert_eq!(outputs.num_refs(), 0);
    }

    #[test]
    fn test_kind_map_substitutes_symbolic_names() {
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let backend = CapturingOutputBackend::new(cas.clone());
        backend.add_kind_map("<output>", "build/main.o");

        let mut file = backend
            .create_file(Path::new("build/main.o"), &OutputConfig::default())
            .unwrap();
        file.write_all(b"bytes").unwrap();
        file.keep().unwrap();

        let outputs = backend.into_cas_object().unwrap();
        let pairs = capture_pairs(cas.as_ref(), &outputs);
        assert_eq!(pairs[0].0, "<output>");
    }

    #[test]
    fn test_add_object_appends_a_pair() {
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let backend = CapturingOutputBackend::new(cas.clone());
        let deps = cas.store(&[], b"dep payload").unwrap();
        backend.add_object("<dependencies>", deps).unwrap();

        let outputs = backend.into_cas_object().unwrap();
        let pairs = capture_pairs(cas.as_ref(), &outputs);
        assert_eq!(
            pairs,
            vec![("<dependencies>".to_string(), b"dep payload".to_vec())]
        );
    }

    #[test]
    fn test_finalize_resets_the_accumulator() {
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let backend = CapturingOutputBackend::new(cas.clone());
        let obj = cas.store(&[], b"x").unwrap();
        backend.add_object("a", obj).unwrap();

        assert_eq!(backend.into_cas_object().unwrap().num_refs(), 2);
        assert_eq!(backend.into_cas_object().unwrap().num_refs(), 0);
    }

    #[test]
    fn test_on_disk_backend_writes_files() {
        let dir = TempDir::new().unwrap();
        let backend = OnDiskOutputBackend::new();
        let target = dir.path().join("sub").join("out.o");

        let mut file = backend
            .create_file(&target, &OutputConfig::default())
            .unwrap();
        file.write_all(b"disk bytes").unwrap();
        file.keep().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"disk bytes");
    }

    #[test]
    fn test_on_disk_discard_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = OnDiskOutputBackend::new();
        let target = dir.path().join("out.o");

        let mut file = backend
            .create_file(&target, &OutputConfig::default())
            .unwrap();
        file.write_all(b"dropped").unwrap();
        file.discard().unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_mirroring_feeds_both_backends() {
        let dir = TempDir::new().unwrap();
        let cas: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let capture = CapturingOutputBackend::new(cas.clone());
        let mirror = MirroringOutputBackend::new(
            Arc::new(capture.clone()),
            Arc::new(OnDiskOutputBackend::new()),
        );

        let target = dir.path().join("mirrored.o");
        let mut file = mirror.create_file(&target, &OutputConfig::default()).unwrap();
        file.write_all(b"both sides").unwrap();
        file.keep().unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"both sides");
        let pairs = capture_pairs(cas.as_ref(), &capture.into_cas_object().unwrap());
        assert_eq!(pairs[0].1, b"both sides");
    }
}
