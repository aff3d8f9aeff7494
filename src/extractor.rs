//! Archive extraction.
//!
//! Downloads a plugin's packaged `.zip` from the blob store and unpacks it
//! into a per-plugin working directory under the host's scratch area.
//! Extraction is destructive to prior attempts (the stale directory is wiped
//! first) and single-flight per plugin: concurrent requests for the same
//! plugin await one in-flight extraction instead of racing.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::error::HostError;

type InflightCell = Arc<OnceCell<Result<PathBuf, HostError>>>;

pub struct Extractor {
    store: Arc<dyn BlobStore>,
    /// `{data_dir}/instances`; each plugin gets `{instances_dir}/{plugin_id}`.
    instances_dir: PathBuf,
    /// One in-flight extraction per plugin ID. Entries are removed as soon
    /// as the operation settles, success or failure, so the next request can
    /// retry a failed extraction.
    inflight: DashMap<Uuid, InflightCell>,
}

impl Extractor {
    pub fn new(store: Arc<dyn BlobStore>, instances_dir: PathBuf) -> Self {
        Self {
            store,
            instances_dir,
            inflight: DashMap::new(),
        }
    }

    /// Working directory a plugin would be extracted to.
    pub fn working_dir(&self, plugin_id: Uuid) -> PathBuf {
        self.instances_dir.join(plugin_id.to_string())
    }

    /// Materialize the plugin's archive into its working directory.
    ///
    /// If an extraction for `plugin_id` is already in progress the caller
    /// awaits that same operation rather than starting a second one.
    pub async fn extract(&self, plugin_id: Uuid) -> Result<PathBuf, HostError> {
        let cell = self
            .inflight
            .entry(plugin_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| self.do_extract(plugin_id))
            .await
            .clone();

        // Settled: drop the lock entry whether or not extraction succeeded.
        self.settle(plugin_id, &cell);
        result
    }

    /// Remove the waiter's own lock entry. A slow waiter from an already
    /// finished extraction must not remove a cell a newer caller inserted,
    /// or two extractions could run concurrently for one plugin.
    fn settle(&self, plugin_id: Uuid, cell: &InflightCell) {
        self.inflight
            .remove_if(&plugin_id, |_, current| Arc::ptr_eq(current, cell));
    }

    async fn do_extract(&self, plugin_id: Uuid) -> Result<PathBuf, HostError> {
        let prefix = format!("{plugin_id}/");
        let store = Arc::clone(&self.store);
        let list_prefix = prefix.clone();
        let names = tokio::task::spawn_blocking(move || store.list(&list_prefix))
            .await
            .map_err(|e| HostError::Internal(format!("listing task failed: {e}")))?
            .map_err(|e| HostError::ExtractionFailed(format!("blob listing failed: {e}")))?;

        let archives: Vec<&String> = names
            .iter()
            .filter(|n| n.ends_with(".zip"))
            .collect();

        let archive = match archives.as_slice() {
            [] => {
                return Err(HostError::NotFound {
                    plugin_id,
                    attempted: vec![prefix.clone(), format!("{prefix}*.zip")],
                });
            }
            [one] => (*one).clone(),
            many => {
                return Err(HostError::ExtractionFailed(format!(
                    "expected exactly one archive for {plugin_id}, found {}",
                    many.len()
                )));
            }
        };

        let key = format!("{prefix}{archive}");
        tracing::debug!(plugin = %plugin_id, %key, "downloading archive");
        let store = Arc::clone(&self.store);
        let download_key = key.clone();
        let bytes = tokio::task::spawn_blocking(move || store.download(&download_key))
            .await
            .map_err(|e| HostError::Internal(format!("download task failed: {e}")))?
            .map_err(|e| HostError::ExtractionFailed(format!("download of {key} failed: {e}")))?;

        let dest = self.working_dir(plugin_id);
        let unpack_dest = dest.clone();
        tokio::task::spawn_blocking(move || unpack_zip(&bytes, &unpack_dest))
            .await
            .map_err(|e| HostError::Internal(format!("unpack task failed: {e}")))??;

        tracing::info!(plugin = %plugin_id, dir = %dest.display(), "archive extracted");
        Ok(dest)
    }
}

/// Wipe any stale directory and unpack `bytes` into `dest`.
fn unpack_zip(bytes: &[u8], dest: &std::path::Path) -> Result<(), HostError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .map_err(|e| HostError::ExtractionFailed(format!("removing stale dir: {e}")))?;
    }
    std::fs::create_dir_all(dest)
        .map_err(|e| HostError::ExtractionFailed(format!("creating working dir: {e}")))?;

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| HostError::ExtractionFailed(format!("corrupt archive: {e}")))?;
    archive
        .extract(dest)
        .map_err(|e| HostError::ExtractionFailed(format!("unpacking archive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Build a valid zip with the given (name, content) entries.
    fn make_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn seed_store(root: &std::path::Path, plugin_id: Uuid, zip_bytes: &[u8]) {
        let dir = root.join(plugin_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bundle.zip"), zip_bytes).unwrap();
    }

    /// Wraps a store and counts downloads.
    struct CountingStore {
        inner: FsBlobStore,
        downloads: AtomicUsize,
    }

    impl BlobStore for CountingStore {
        fn list(&self, prefix: &str) -> std::io::Result<Vec<String>> {
            self.inner.list(prefix)
        }
        fn download(&self, key: &str) -> std::io::Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            // Slow the download down so concurrent callers overlap.
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.inner.download(key)
        }
    }

    #[tokio::test]
    async fn missing_archive_is_not_found_with_attempted_paths() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );

        let id = Uuid::new_v4();
        let err = extractor.extract(id).await.unwrap_err();
        match err {
            HostError::NotFound { plugin_id, attempted } => {
                assert_eq!(plugin_id, id);
                assert!(attempted.iter().any(|p| p.contains(&id.to_string())));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extracts_bundle_layout() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        seed_store(
            blob.path(),
            id,
            &make_zip(&[
                ("public/index.html", "<html></html>"),
                ("public/script.js", "console.log(1)"),
                ("package.json", "{}"),
            ]),
        );

        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );
        let dir = extractor.extract(id).await.unwrap();
        assert!(dir.join("public/index.html").is_file());
        assert!(dir.join("public/script.js").is_file());
        assert!(dir.join("package.json").is_file());
    }

    #[tokio::test]
    async fn re_extraction_wipes_stale_files() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        seed_store(blob.path(), id, &make_zip(&[("public/index.html", "v2")]));

        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );

        // Simulate debris from a previous run.
        let stale = extractor.working_dir(id).join("leftover.tmp");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        let dir = extractor.extract(id).await.unwrap();
        assert!(!dir.join("leftover.tmp").exists());
        assert_eq!(
            std::fs::read_to_string(dir.join("public/index.html")).unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn multiple_archives_is_an_error() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let dir = blob.path().join(id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.zip"), b"x").unwrap();
        std::fs::write(dir.join("b.zip"), b"y").unwrap();

        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );
        let err = extractor.extract(id).await.unwrap_err();
        assert!(matches!(err, HostError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn concurrent_extracts_share_one_download() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        seed_store(blob.path(), id, &make_zip(&[("public/index.html", "hi")]));

        let store = Arc::new(CountingStore {
            inner: FsBlobStore::new(blob.path()),
            downloads: AtomicUsize::new(0),
        });
        let extractor = Arc::new(Extractor::new(
            store.clone(),
            scratch.path().to_path_buf(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ex = Arc::clone(&extractor);
            handles.push(tokio::spawn(async move { ex.extract(id).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
        // The lock entry must be gone once everything settled.
        assert!(extractor.inflight.is_empty());
    }

    #[tokio::test]
    async fn late_waiter_leaves_newer_inflight_entry_alone() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );
        let id = Uuid::new_v4();

        // A newer extraction wave is in flight under its own cell.
        let current: InflightCell = Arc::new(OnceCell::new());
        extractor.inflight.insert(id, Arc::clone(&current));

        // A waiter from a previous, already settled wave cleans up late: it
        // must not evict the newer wave's lock entry.
        let stale: InflightCell = Arc::new(OnceCell::new());
        extractor.settle(id, &stale);
        assert!(extractor.inflight.contains_key(&id));

        // The owner of the current cell removes it as usual.
        extractor.settle(id, &current);
        assert!(!extractor.inflight.contains_key(&id));
    }

    #[tokio::test]
    async fn failed_extraction_releases_the_lock() {
        let blob = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        // Corrupt archive: not a zip.
        let dir = blob.path().join(id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bundle.zip"), b"definitely not a zip").unwrap();

        let extractor = Extractor::new(
            Arc::new(FsBlobStore::new(blob.path())),
            scratch.path().to_path_buf(),
        );
        assert!(extractor.extract(id).await.is_err());
        assert!(extractor.inflight.is_empty());

        // A later attempt starts fresh instead of replaying the cached error.
        std::fs::write(
            dir.join("bundle.zip"),
            make_zip(&[("public/index.html", "ok")]),
        )
        .unwrap();
        assert!(extractor.extract(id).await.is_ok());
    }
}
