//! Compile-job cache controller
//!
//! Drives one compile through the cache: canonicalize the invocation,
//! derive the action key, look it up, and either replay the cached result
//! tree or run the compile with capturing hooks installed and cache what it
//! produced. Failed compiles are never cached. Lookup errors are consumed
//! and treated as misses; storage errors while finalizing a computed result
//! propagate, since dropping a result silently would turn a later "hit"
//! into a lie.

use crate::atomic_file::write_atomic;
use crate::deps::{replay_dependencies, DependencyCollector};
use crate::diags::DiagnosticsCapture;
use crate::invocation::{derive_action_key, CompileInvocation};
use crate::output::{
    CapturingOutputBackend, MirroringOutputBackend, OnDiskOutputBackend, OutputBackend,
};
use jobcache_cas::{
    ActionCache, CacheError, CasId, ObjectRef, ObjectStore, Result, Tree, TreeBuilder,
    TreeEntryKind,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

pub const MAIN_OUTPUT_KIND_NAME: &str = "<output>";
pub const SERIALIZED_DIAGS_KIND_NAME: &str = "<serial-diags>";
pub const DEPENDENCIES_KIND_NAME: &str = "<dependencies>";

const RESULT_TREE_OUTPUTS: &str = "outputs";
const RESULT_TREE_STDERR: &str = "stderr";

/// Output categories decoupling the action key from concrete paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    MainOutput,
    SerializedDiagnostics,
    Dependencies,
}

impl OutputKind {
    pub fn all() -> [OutputKind; 3] {
        [
            Self::MainOutput,
            Self::SerializedDiagnostics,
            Self::Dependencies,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MainOutput => MAIN_OUTPUT_KIND_NAME,
            Self::SerializedDiagnostics => SERIALIZED_DIAGS_KIND_NAME,
            Self::Dependencies => DEPENDENCIES_KIND_NAME,
        }
    }

    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            MAIN_OUTPUT_KIND_NAME => Some(Self::MainOutput),
            SERIALIZED_DIAGS_KIND_NAME => Some(Self::SerializedDiagnostics),
            DEPENDENCIES_KIND_NAME => Some(Self::Dependencies),
            _ => None,
        }
    }
}

/// How a run went through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Caching was not requested for this invocation.
    Skipped,
    Hit,
    Miss,
}

/// Structured result of one cached compile, suitable for remark printing.
#[derive(Debug)]
pub struct CacheOutcome {
    pub status: CacheStatus,
    pub key: Option<CasId>,
    /// Id of the result tree, when one was found or produced.
    pub result: Option<CasId>,
    /// Whether the compile itself succeeded.
    pub success: bool,
    /// Whether a result ended up in the cache.
    pub cached: bool,
    /// Stderr bytes replayed from the cache on a hit.
    pub replayed_stderr: Option<Vec<u8>>,
}

/// Hooks handed to the compile function on a cache miss (or uncached run).
pub struct CompileContext<'a> {
    /// The canonicalized invocation the compile should honor.
    pub invocation: &'a CompileInvocation,
    /// Where to create output files.
    pub outputs: &'a dyn OutputBackend,
    /// Where to report diagnostics.
    pub diags: &'a DiagnosticsCapture,
    /// Where to record dependencies that were read.
    pub deps: &'a DependencyCollector,
}

/// The invocation-supplied output locations, extracted before
/// canonicalization strips them.
struct OutputPaths {
    working_dir: PathBuf,
    output_file: String,
    serial_diags_file: String,
    dependencies_file: String,
    dependency_targets: Vec<String>,
}

impl OutputPaths {
    fn extract(invocation: &CompileInvocation) -> Self {
        let dependency_targets = if invocation.dependency_targets.is_empty() {
            vec![invocation.output_file.clone()]
        } else {
            invocation.dependency_targets.clone()
        };
        Self {
            working_dir: invocation.working_dir.clone(),
            output_file: invocation.output_file.clone(),
            serial_diags_file: invocation.serial_diags_file.clone(),
            dependencies_file: invocation.dependencies_file.clone(),
            dependency_targets,
        }
    }

    fn for_kind(&self, kind: OutputKind) -> &str {
        match kind {
            OutputKind::MainOutput => &self.output_file,
            OutputKind::SerializedDiagnostics => &self.serial_diags_file,
            OutputKind::Dependencies => &self.dependencies_file,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.working_dir.join(path)
        }
    }
}

/// The compile-job cache.
pub struct CompileJobCache {
    cas: Arc<dyn ObjectStore>,
    cache: Arc<dyn ActionCache>,
}

impl CompileJobCache {
    /// Build the CAS and action cache from the invocation's frozen
    /// configuration.
    pub fn from_invocation(invocation: &CompileInvocation) -> Result<Self> {
        let (cas, cache) = invocation.cas.clone().freeze().create_stores()?;
        Ok(Self { cas, cache })
    }

    pub fn with_stores(cas: Arc<dyn ObjectStore>, cache: Arc<dyn ActionCache>) -> Self {
        Self { cas, cache }
    }

    pub fn cas(&self) -> &Arc<dyn ObjectStore> {
        &self.cas
    }

    /// Run one compile through the cache.
    ///
    /// `compile` is invoked only on a miss (or when caching is disabled),
    /// with capture hooks installed; it returns whether the compile
    /// succeeded.
    pub fn run_cached<F>(&self, invocation: &CompileInvocation, compile: F) -> Result<CacheOutcome>
    where
        F: FnOnce(&CompileContext<'_>) -> Result<bool>,
    {
        // Extract the caching switch and canonicalize it away.
        let mut invocation = invocation.clone();
        let caching = invocation.cache_compile_job;
        invocation.cache_compile_job = false;

        let paths = OutputPaths::extract(&invocation);

        if !caching {
            return self.run_uncached(&invocation, &paths, compile);
        }

        // Hide the CAS configuration from the compile so its location
        // cannot leak into diagnostics, and disable timestamp embedding.
        let _frozen = std::mem::take(&mut invocation.cas).freeze();
        invocation.include_timestamps = false;

        let key = derive_action_key(&invocation)?;

        // Lookup failures (including dangling values) degrade to misses.
        let found = match self.cache.get(&key) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "action cache lookup failed; treating as miss");
                None
            }
        };

        if let Some(result_ref) = found {
            let result_id = self.cas.get_id(result_ref)?;
            tracing::info!(key = %key, result = %result_id, "compile job cache hit");
            let replayed_stderr = self.replay(&paths, result_ref, false)?;
            return Ok(CacheOutcome {
                status: CacheStatus::Hit,
                key: Some(key),
                result: Some(result_id),
                success: true,
                cached: true,
                replayed_stderr: Some(replayed_stderr),
            });
        }
        tracing::info!(key = %key, "compile job cache miss");

        // Install the capturing backend, mirrored to disk so the miss run
        // streams its outputs live.
        let captured = CapturingOutputBackend::new(self.cas.clone());
        for kind in OutputKind::all() {
            let path = paths.for_kind(kind);
            if !path.is_empty() {
                captured.add_kind_map(kind.name(), path);
                let resolved = paths.resolve(path).to_string_lossy().into_owned();
                if resolved != path {
                    captured.add_kind_map(kind.name(), resolved);
                }
            }
        }
        let mirror = MirroringOutputBackend::new(
            Arc::new(captured.clone()),
            Arc::new(OnDiskOutputBackend::new()),
        );
        let diags = DiagnosticsCapture::new(true);
        let deps = DependencyCollector::new();

        let context = CompileContext {
            invocation: &invocation,
            outputs: &mirror,
            diags: &diags,
            deps: &deps,
        };
        let success = compile(&context)?;

        if !success {
            // Never cache failed compiles.
            tracing::debug!(key = %key, "compile failed; result not cached");
            return Ok(CacheOutcome {
                status: CacheStatus::Miss,
                key: Some(key),
                result: None,
                success: false,
                cached: false,
                replayed_stderr: None,
            });
        }

        // Always produce the serialized-diagnostics object, requested or
        // not, so the key stays independent of that flag.
        let serial_diags = self.cas.store(&[], &diags.serialized())?;
        captured.add_object(SERIALIZED_DIAGS_KIND_NAME, serial_diags)?;

        if !paths.dependencies_file.is_empty() {
            let deps_ref = deps.store(self.cas.as_ref())?;
            captured.add_object(DEPENDENCIES_KIND_NAME, deps_ref)?;
        }

        let outputs = captured.into_cas_object()?;
        let stderr = self.cas.store(&[], &diags.rendered())?;
        let mut builder = TreeBuilder::new();
        builder
            .push(RESULT_TREE_OUTPUTS, TreeEntryKind::Regular, outputs.reference())
            .push(RESULT_TREE_STDERR, TreeEntryKind::Regular, stderr);
        let result = builder.create(self.cas.as_ref())?;
        self.cache.put(&key, result.reference())?;

        // Replay from the just-computed tree so the on-disk state matches
        // what a later hit will produce. Stderr already streamed live.
        self.replay(&paths, result.reference(), true)?;

        Ok(CacheOutcome {
            status: CacheStatus::Miss,
            key: Some(key),
            result: Some(result.id()),
            success: true,
            cached: true,
            replayed_stderr: None,
        })
    }

    fn run_uncached<F>(
        &self,
        invocation: &CompileInvocation,
        paths: &OutputPaths,
        compile: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce(&CompileContext<'_>) -> Result<bool>,
    {
        let backend = OnDiskOutputBackend::new();
        let diags = DiagnosticsCapture::new(true);
        let deps = DependencyCollector::new();
        let context = CompileContext {
            invocation,
            outputs: &backend,
            diags: &diags,
            deps: &deps,
        };
        let success = compile(&context)?;

        if success && !paths.dependencies_file.is_empty() {
            let deps_ref = deps.store(self.cas.as_ref())?;
            let mut rendered = Vec::new();
            replay_dependencies(
                self.cas.as_ref(),
                deps_ref,
                &paths.dependency_targets,
                &mut rendered,
            )?;
            write_atomic(&paths.resolve(&paths.dependencies_file), &rendered)?;
        }
        if success && !paths.serial_diags_file.is_empty() {
            write_atomic(&paths.resolve(&paths.serial_diags_file), &diags.serialized())?;
        }

        Ok(CacheOutcome {
            status: CacheStatus::Skipped,
            key: None,
            result: None,
            success,
            cached: false,
            replayed_stderr: None,
        })
    }

    /// Write a result tree's outputs to their invocation-supplied paths.
    ///
    /// On a hit the cached stderr is printed; on a just-computed result it
    /// already streamed live and only the outputs are decanonicalized.
    fn replay(
        &self,
        paths: &OutputPaths,
        result: ObjectRef,
        just_computed: bool,
    ) -> Result<Vec<u8>> {
        let tree = Tree::load(self.cas.as_ref(), result)?;
        let missing = |entry: &str| {
            CacheError::corruption(
                "<result tree>",
                format!("result tree is missing its '{entry}' entry"),
            )
        };

        let stderr_entry = tree.lookup(RESULT_TREE_STDERR).ok_or_else(|| missing(RESULT_TREE_STDERR))?;
        let stderr_bytes = self.cas.load(stderr_entry.reference)?.data().to_vec();
        if !just_computed && !stderr_bytes.is_empty() {
            let _ = std::io::stderr().write_all(&stderr_bytes);
        }

        let outputs_entry = tree
            .lookup(RESULT_TREE_OUTPUTS)
            .ok_or_else(|| missing(RESULT_TREE_OUTPUTS))?;
        let outputs = self.cas.load(outputs_entry.reference)?;

        let mut index = 0;
        while index + 1 < outputs.num_refs() {
            let (Some(name_ref), Some(bytes_ref)) =
                (outputs.ref_at(index), outputs.ref_at(index + 1))
            else {
                return Err(missing("output pair"));
            };
            index += 2;

            let name_blob = self.cas.load(name_ref)?;
            let name = String::from_utf8_lossy(name_blob.data()).into_owned();
            let kind = OutputKind::for_name(&name);
            let path = match kind {
                Some(kind) => paths.for_kind(kind).to_string(),
                None => name,
            };
            if path.is_empty() {
                // Produced on every miss but not requested this time, like
                // the serialized diagnostics.
                continue;
            }

            let contents = if kind == Some(OutputKind::Dependencies) {
                let mut rendered = Vec::new();
                replay_dependencies(
                    self.cas.as_ref(),
                    bytes_ref,
                    &paths.dependency_targets,
                    &mut rendered,
                )?;
                rendered
            } else {
                self.cas.load(bytes_ref)?.data().to_vec()
            };

            let resolved = paths.resolve(&path);
            write_atomic(&resolved, &contents)?;
            tracing::debug!(path = %resolved.display(), bytes = contents.len(), "replayed output");
        }

        Ok(stderr_bytes)
    }
}
