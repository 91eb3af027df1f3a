//! Atomic file writes for replayed outputs
//!
//! Replay must never leave a torn output on disk: content is written to a
//! temporary file in the target directory, synced, then renamed into place.

use jobcache_cas::{CacheError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Write `content` to `path` atomically via a temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).map_or_else(
        || Path::new(".").to_path_buf(),
        |p| p.to_path_buf(),
    );

    fs::create_dir_all(&parent)
        .map_err(|e| CacheError::io(&parent, "create parent directory", e))?;

    // Same directory as the target so the rename stays atomic.
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| CacheError::io(&temp_path, "create temporary file", e))?;

        file.write_all(content)
            .map_err(|e| CacheError::io(&temp_path, "write temporary file", e))?;

        file.sync_all()
            .map_err(|e| CacheError::io(&temp_path, "sync temporary file", e))?;

        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CacheError::io(path, "rename temporary file into place", e)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("out.o");

        write_atomic(&file_path, b"object bytes").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"object bytes");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("nested").join("out.o");

        write_atomic(&file_path, b"nested").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"nested");
    }

    #[test]
    fn test_atomic_write_overwrites_existing() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("out.o");

        fs::write(&file_path, "old").unwrap();
        write_atomic(&file_path, b"new").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"new");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        write_atomic(&temp_dir.path().join("out.o"), b"x").unwrap();
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
