//! Compile-job result cache
//!
//! Memoizes compiler invocations over a content-addressed store: a
//! canonicalized invocation hashes to an action key, the action cache binds
//! that key to a result tree of captured outputs, and subsequent identical
//! invocations replay the tree instead of running the compiler.
//!
//! The CAS substrate itself lives in the `jobcache-cas` crate, re-exported
//! here as [`cas`].

pub use jobcache_cas as cas;

pub mod atomic_file;
pub mod config;
pub mod controller;
pub mod deps;
pub mod diags;
pub mod invocation;
pub mod output;

pub use config::{CasOptions, FrozenCasOptions};
pub use controller::{
    CacheOutcome, CacheStatus, CompileContext, CompileJobCache, OutputKind,
    DEPENDENCIES_KIND_NAME, MAIN_OUTPUT_KIND_NAME, SERIALIZED_DIAGS_KIND_NAME,
};
pub use deps::{replay_dependencies, DependencyCollector, DepscanMode};
pub use diags::{Diagnostic, DiagnosticsCapture, Severity};
pub use invocation::{derive_action_key, CompileInvocation};
pub use output::{
    CapturingOutputBackend, MirroringOutputBackend, OnDiskOutputBackend, OutputBackend,
    OutputConfig, OutputFile,
};
