//! Compile invocations and action-key derivation
//!
//! The action key is the digest of the invocation's canonical form. Only
//! semantic inputs participate: arguments, input paths and their content
//! digests, and canonicalized feature switches. Anything that merely names
//! a location (the output path, the serialized-diagnostics path, the
//! dependency-file path) is replaced by a fixed placeholder, so moving
//! outputs around preserves the key.

use crate::config::CasOptions;
use jobcache_cas::{CacheError, CasId, Digest, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};

/// One compiler invocation as handed to the cache controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileInvocation {
    /// Arguments that affect the meaning of the compile.
    pub arguments: Vec<String>,
    /// Directory input paths are resolved against.
    pub working_dir: PathBuf,
    /// Source inputs; their content is hashed into the key.
    pub inputs: Vec<PathBuf>,
    /// Primary output path.
    pub output_file: String,
    /// Serialized-diagnostics path; empty when not requested.
    pub serial_diags_file: String,
    /// Dependency-file path; empty when not requested.
    pub dependencies_file: String,
    /// Target names written into the dependency file on replay.
    pub dependency_targets: Vec<String>,
    /// Timestamp embedding; forced off while caching so outputs stay
    /// deterministic.
    pub include_timestamps: bool,
    /// Whether this job participates in caching at all.
    pub cache_compile_job: bool,
    /// CAS configuration; extracted and frozen before the job runs.
    pub cas: CasOptions,
}

impl CompileInvocation {
    /// Resolve a possibly relative input path against the working dir.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

/// Placeholder substituted for location-naming fields in the canonical
/// form. Constant, so requesting or moving an output never changes the key.
const PATH_PLACEHOLDER: &str = "-";

#[derive(Serialize)]
struct CanonicalInput {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct CanonicalInvocation<'a> {
    arguments: &'a [String],
    inputs: Vec<CanonicalInput>,
    output_file: &'static str,
    serial_diags_file: &'static str,
    dependencies_file: &'static str,
    include_timestamps: bool,
}

/// Hash the canonicalized invocation into the action key.
pub fn derive_action_key(invocation: &CompileInvocation) -> Result<CasId> {
    let mut inputs = invocation
        .inputs
        .iter()
        .map(|path| {
            let resolved = invocation.resolve(path);
            let content = hash_file(&resolved)?;
            Ok(CanonicalInput {
                path: path.to_string_lossy().into_owned(),
                content: content.to_hex(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    inputs.sort_by(|a, b| a.path.cmp(&b.path));

    let canonical = CanonicalInvocation {
        arguments: &invocation.arguments,
        inputs,
        output_file: PATH_PLACEHOLDER,
        serial_diags_file: PATH_PLACEHOLDER,
        dependencies_file: PATH_PLACEHOLDER,
        include_timestamps: false,
    };
    let encoded = serde_json::to_vec(&canonical).map_err(|e| CacheError::InvalidId {
        text: "<canonical invocation>".to_string(),
        reason: format!("failed to encode: {e}"),
        recovery_hint: jobcache_cas::RecoveryHint::NoRecovery,
    })?;
    Ok(CasId::new(Digest::compute(&encoded)))
}

/// Stream a file into a digest.
fn hash_file(path: &Path) -> Result<Digest> {
    let file =
        std::fs::File::open(path).map_err(|e| CacheError::io(path, "open input for hashing", e))?;
    let mut reader = std::io::BufReader::with_capacity(8192, file);
    let mut hasher = jobcache_cas::DigestHasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| CacheError::io(path, "read input for hashing", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(dir: &TempDir) -> CompileInvocation {
        std::fs::write(dir.path().join("main.c"), "int main(void) { return 0; }").unwrap();
        CompileInvocation {
            arguments: vec!["-O2".to_string(), "-g".to_string()],
            working_dir: dir.path().to_path_buf(),
            inputs: vec![PathBuf::from("main.c")],
            output_file: "main.o".to_string(),
            serial_diags_file: String::new(),
            dependencies_file: String::new(),
            dependency_targets: vec![],
            include_timestamps: false,
            cache_compile_job: true,
            cas: CasOptions::in_memory(),
        }
    }

    #[test]
    fn test_key_is_stable() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(&dir);
        assert_eq!(
            derive_action_key(&inv).unwrap(),
            derive_action_key(&inv).unwrap()
        );
    }

    #[test]
    fn test_output_paths_do_not_affect_the_key() {
        let dir = TempDir::new().unwrap();
        let base = invocation(&dir);
        let key = derive_action_key(&base).unwrap();

        let mut moved = base.clone();
        moved.output_file = "elsewhere/renamed.o".to_string();
        moved.serial_diags_file = "diags.dia".to_string();
        moved.dependencies_file = "deps.d".to_string();
        assert_eq!(derive_action_key(&moved).unwrap(), key);
    }

    #[test]
    fn test_semantic_changes_change_the_key() {
        let dir = TempDir::new().unwrap();
        let base = invocation(&dir);
        let key = derive_action_key(&base).unwrap();

        let mut different_args = base.clone();
        different_args.arguments.push("-DEXTRA=1".to_string());
        assert_ne!(derive_action_key(&different_args).unwrap(), key);

        std::fs::write(dir.path().join("main.c"), "int main(void) { return 1; }").unwrap();
        assert_ne!(derive_action_key(&base).unwrap(), key);
    }

    #[test]
    fn test_timestamp_setting_is_canonicalized_away() {
        let dir = TempDir::new().unwrap();
        let base = invocation(&dir);
        let mut with_timestamps = base.clone();
        with_timestamps.include_timestamps = true;
        assert_eq!(
            derive_action_key(&with_timestamps).unwrap(),
            derive_action_key(&base).unwrap()
        );
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut inv = invocation(&dir);
        inv.inputs.push(PathBuf::from("missing.c"));
        assert!(derive_action_key(&inv).is_err());
    }
}
