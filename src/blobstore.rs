//! Blob store contract for packaged plugin archives.
//!
//! The store is an external collaborator: the host only needs `list` and
//! `download`, keyed by `{plugin_id}/<filename>`. The trait exists so tests
//! can wrap a store with counting hooks and so deployments can swap the
//! filesystem layout for an object store without touching the extractor.

use std::io;
use std::path::PathBuf;

/// Read-only view of the archive store. Methods are synchronous; callers
/// run them on the blocking pool.
pub trait BlobStore: Send + Sync {
    /// Filenames under `prefix` (a `{plugin_id}/` directory). An unknown
    /// prefix is an empty listing, not an error.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Raw bytes for `key` (`{plugin_id}/<filename>`).
    fn download(&self, key: &str) -> io::Result<Vec<u8>>;
}

/// Filesystem-backed store: `{root}/{plugin_id}/<archive>.zip`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.root.join(prefix.trim_end_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn download(&self, key: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_unknown_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.list("missing/").unwrap().is_empty());
    }

    #[test]
    fn list_and_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("abc");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("bundle.zip"), b"zipbytes").unwrap();

        let store = FsBlobStore::new(dir.path());
        let names = store.list("abc/").unwrap();
        assert_eq!(names, vec!["bundle.zip".to_string()]);
        assert_eq!(store.download("abc/bundle.zip").unwrap(), b"zipbytes");
    }

    #[test]
    fn list_skips_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("abc");
        std::fs::create_dir_all(plugin_dir.join("nested")).unwrap();
        std::fs::write(plugin_dir.join("bundle.zip"), b"z").unwrap();

        let store = FsBlobStore::new(dir.path());
        assert_eq!(store.list("abc").unwrap(), vec!["bundle.zip".to_string()]);
    }
}
