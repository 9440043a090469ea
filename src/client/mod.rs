//! Client side of a sync: chunking a local file, sending what the server lacks, and
//! fetching files back.

use std::collections::HashSet;
use std::path::Path;

use futures_util::{stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::chunker::{chunk_all, signature_of};
use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::fingerprint::{FileHasher, Fingerprint};
use crate::protocol::{ChunkPayload, DeltaSync, GetMissingChunks, UploadFrame, UploadHeader};
use crate::signature_cache::SignatureCache;
use crate::store::{RecipeSummary, Timestamp};

pub mod http;

pub use http::HttpClient;

/// Outcome of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub file_id: String,
    pub file_size: u64,
    pub chunk_count: usize,
    pub uploaded_chunks: usize,
    pub uploaded_bytes: u64,
    /// Nothing was sent because the file matched its last synced signature.
    pub skipped: bool,
    /// Recipe version after the commit, `None` when skipped.
    pub recipe_version: Option<u64>,
}

pub struct SyncClient<T> {
    transport: T,
    config: ClientConfig,
    cache: Option<SignatureCache>,
}

impl<T: DeltaSync> SyncClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            cache: None,
        }
    }

    /// Records each successfully synced signature in `cache`.
    pub fn with_signature_cache(mut self, cache: SignatureCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Syncs `path` under its own path as file id.
    pub async fn sync_file(&self, path: &Path) -> Result<SyncReport, SyncError> {
        let file_id = path.to_string_lossy();
        self.sync_file_as(path, &file_id).await
    }

    /// Runs a single sync attempt of `path` into `file_id`. Failures are not retried.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn sync_file_as(&self, path: &Path, file_id: &str) -> Result<SyncReport, SyncError> {
        let source_io = |source| SyncError::SourceIo {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).await.map_err(source_io)?;
        let last_modified = file
            .metadata()
            .await
            .and_then(|metadata| metadata.modified())
            .map(Timestamp::from)
            .map_err(source_io)?;

        let chunks = chunk_all(self.config.chunker, file).await?;
        let signature = signature_of(&chunks);
        let mut hasher = FileHasher::new();
        for chunk in &chunks {
            hasher.update(&chunk.payload);
        }

        let mut report = SyncReport {
            file_id: file_id.into(),
            file_size: hasher.len(),
            chunk_count: chunks.len(),
            uploaded_chunks: 0,
            uploaded_bytes: 0,
            skipped: false,
            recipe_version: None,
        };

        if self.config.skip_unchanged
            && self
                .unchanged_since_last_sync(path, last_modified, &signature)
                .await?
        {
            info!(file_id, "unchanged since last sync");
            report.skipped = true;
            return Ok(report);
        }

        let diff = self
            .transport
            .get_missing_chunks(GetMissingChunks {
                file_id: file_id.into(),
                chunk_fingerprints: signature.clone(),
            })
            .await?;

        // the same chunk can occur several times within one file but is sent only once
        let mut missing: HashSet<_> = diff.missing_fingerprints.into_iter().collect();
        let payloads: Vec<ChunkPayload> = chunks
            .iter()
            .filter(|chunk| missing.remove(&chunk.fingerprint))
            .map(ChunkPayload::from)
            .collect();
        report.uploaded_chunks = payloads.len();
        report.uploaded_bytes = payloads.iter().map(|chunk| chunk.payload.len() as u64).sum();
        debug!(
            file_id,
            chunks = chunks.len(),
            missing = payloads.len(),
            "uploading missing chunks"
        );

        let header = UploadHeader {
            file_id: file_id.into(),
            chunk_fingerprints: signature.clone(),
            file_size: hasher.len(),
            file_digest: hasher.finalize(),
            base_version: diff.base_version,
            expected_chunks: payloads.len() as u32,
        };
        let frames = std::iter::once(UploadFrame::Begin(header))
            .chain(payloads.into_iter().map(UploadFrame::Chunk))
            .chain(std::iter::once(UploadFrame::End))
            .map(Ok::<_, SyncError>);
        let status = self
            .transport
            .upload_chunks(stream::iter(frames).boxed())
            .await?;
        report.recipe_version = Some(status.recipe_version);

        if let Some(cache) = &self.cache {
            cache.record(path, last_modified, &signature).await?;
        }

        info!(
            file_id,
            uploaded = report.uploaded_chunks,
            bytes = report.uploaded_bytes,
            version = status.recipe_version,
            "sync complete"
        );
        Ok(report)
    }

    async fn unchanged_since_last_sync(
        &self,
        path: &Path,
        last_modified: Timestamp,
        signature: &[Fingerprint],
    ) -> Result<bool, SyncError> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        Ok(cache
            .get(path)
            .await?
            .is_some_and(|record| record.matches(last_modified, signature)))
    }

    /// Fetches `file_id` into `dest`.
    ///
    /// The file is assembled in a temporary file next to `dest` and only moved into place
    /// once every chunk, the total size and the whole-file digest check out, so a failed
    /// download never leaves a partial file behind.
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download_file(
        &self,
        file_id: &str,
        dest: &Path,
    ) -> Result<RecipeSummary, SyncError> {
        let (summary, mut chunks) = self.transport.download_file(file_id).await?;

        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".deltasync-")
            .tempfile_in(dir)?;
        let mut file = File::from_std(temp.as_file().try_clone()?);

        let mut hasher = FileHasher::new();
        let mut received = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            chunk.verify()?;
            hasher.update(&chunk.payload);
            received += 1;
            file.write_all(&chunk.payload).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if received != summary.chunk_count {
            return Err(SyncError::Integrity(format!(
                "expected {} chunks of {file_id:?}, received {received}",
                summary.chunk_count
            )));
        }
        if hasher.len() != summary.size {
            return Err(SyncError::Integrity(format!(
                "expected {} bytes of {file_id:?}, received {}",
                summary.size,
                hasher.len()
            )));
        }
        let digest = hasher.finalize();
        if digest != summary.digest {
            return Err(SyncError::Integrity(format!(
                "{file_id:?} reassembled to {digest}, expected {}",
                summary.digest
            )));
        }

        temp.persist(dest).map_err(|err| SyncError::Io(err.error))?;
        info!(file_id, size = summary.size, "download complete");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::server::SyncServer;
    use crate::store::{ChunkStore, MemoryStore};
    use crate::testutil::random_bytes;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        client: SyncClient<SyncServer>,
    }

    impl Fixture {
        fn new(config: ClientConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let server = SyncServer::new(store.clone(), store.clone());
            Self {
                dir: tempfile::tempdir().unwrap(),
                store,
                client: SyncClient::new(server, config),
            }
        }

        fn with_signature_cache(mut self, cache: SignatureCache) -> Self {
            self.client = self.client.with_signature_cache(cache);
            self
        }

        fn write(&self, name: &str, contents: &[u8]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }

        async fn read_back(&self, file_id: &str) -> Vec<u8> {
            let dest = self.dir.path().join("restored");
            self.client.download_file(file_id, &dest).await.unwrap();
            std::fs::read(dest).unwrap()
        }
    }

    #[tokio::test]
    async fn synced_file_downloads_identically() {
        let fixture = Fixture::new(ClientConfig::default());
        let contents = random_bytes(10, 3 * MIB / 2);
        let path = fixture.write("data.bin", &contents);

        let report = fixture.client.sync_file_as(&path, "data.bin").await.unwrap();
        assert_eq!(report.file_size, contents.len() as u64);
        assert_eq!(report.uploaded_chunks, report.chunk_count);
        assert_eq!(report.recipe_version, Some(1));

        assert_eq!(fixture.read_back("data.bin").await, contents);
    }

    #[tokio::test]
    async fn small_edit_uploads_only_nearby_chunks() {
        let fixture = Fixture::new(ClientConfig::default());
        let mut contents = random_bytes(11, MIB);
        let path = fixture.write("edit.bin", &contents);

        let first = fixture.client.sync_file_as(&path, "edit.bin").await.unwrap();
        assert!(first.chunk_count >= 4);

        for byte in &mut contents[MIB / 2..MIB / 2 + 10] {
            *byte = byte.wrapping_add(1);
        }
        fixture.write("edit.bin", &contents);

        let second = fixture.client.sync_file_as(&path, "edit.bin").await.unwrap();
        assert!(
            (1..=2).contains(&second.uploaded_chunks),
            "uploaded {} chunks",
            second.uploaded_chunks
        );
        assert_eq!(second.recipe_version, Some(2));

        assert_eq!(fixture.read_back("edit.bin").await, contents);
    }

    #[tokio::test]
    async fn unchanged_file_uploads_nothing() {
        let fixture = Fixture::new(ClientConfig::default());
        let path = fixture.write("same.bin", &random_bytes(12, MIB / 2));

        fixture.client.sync_file_as(&path, "same.bin").await.unwrap();
        let before = fixture.client.transport().list_files().await.unwrap();

        let again = fixture.client.sync_file_as(&path, "same.bin").await.unwrap();
        assert_eq!(again.uploaded_chunks, 0);
        assert!(!again.skipped);
        assert_eq!(again.recipe_version, Some(1));

        let after = fixture.client.transport().list_files().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let fixture = Fixture::new(ClientConfig::default());
        let contents = random_bytes(13, MIB);
        let original = fixture.write("original.bin", &contents);
        let copy = fixture.write("copy.bin", &contents);

        fixture.client.sync_file_as(&original, "original").await.unwrap();
        let stats = fixture.store.stats().await.unwrap();

        let report = fixture.client.sync_file_as(&copy, "copy").await.unwrap();
        assert_eq!(report.uploaded_chunks, 0);
        assert_eq!(fixture.store.stats().await.unwrap(), stats);
        assert_eq!(fixture.read_back("copy").await, contents);
    }

    #[tokio::test]
    async fn repeated_chunks_are_sent_once() {
        let fixture = Fixture::new(ClientConfig::default());
        // uniform content is cut into identical chunks
        let contents = vec![0u8; MIB];
        let path = fixture.write("zeros.bin", &contents);

        let signature = signature_of(&chunk_all(ChunkerConfig::default(), &contents[..]).await.unwrap());
        let distinct: HashSet<_> = signature.iter().collect();
        assert!(distinct.len() < signature.len());

        let report = fixture.client.sync_file_as(&path, "zeros").await.unwrap();
        assert_eq!(report.chunk_count, signature.len());
        assert_eq!(report.uploaded_chunks, distinct.len());
        assert_eq!(fixture.read_back("zeros").await, contents);
    }

    #[tokio::test]
    async fn signature_cache_skips_unchanged_files() {
        let cache_dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new(ClientConfig {
            skip_unchanged: true,
            ..Default::default()
        })
        .with_signature_cache(SignatureCache::open(cache_dir.path()).unwrap());

        let path = fixture.write("notes.txt", b"first draft");
        let first = fixture.client.sync_file(&path).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.file_id, path.to_string_lossy());

        let second = fixture.client.sync_file(&path).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.uploaded_chunks, 0);
        assert_eq!(second.recipe_version, None);

        fixture.write("notes.txt", b"second draft");
        let third = fixture.client.sync_file(&path).await.unwrap();
        assert!(!third.skipped);
        assert_eq!(third.uploaded_chunks, 1);
        assert_eq!(third.recipe_version, Some(2));
    }

    #[tokio::test]
    async fn empty_file_round_trips() {
        let fixture = Fixture::new(ClientConfig::default());
        let path = fixture.write("empty", b"");

        let report = fixture.client.sync_file_as(&path, "empty").await.unwrap();
        assert_eq!(report.chunk_count, 0);
        assert_eq!(report.recipe_version, Some(1));

        assert!(fixture.read_back("empty").await.is_empty());
    }

    #[tokio::test]
    async fn missing_source_is_reported_without_contacting_server() {
        let fixture = Fixture::new(ClientConfig::default());
        let path = fixture.dir.path().join("does-not-exist");

        let err = fixture.client.sync_file(&path).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceIo { path: failed, .. } if failed == path));
        assert!(fixture.client.transport().list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_download_leaves_no_file() {
        let fixture = Fixture::new(ClientConfig::default());
        let dest = fixture.dir.path().join("never");

        let err = fixture.client.download_file("never", &dest).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(fixture.dir.path()).unwrap().count(), 0);
    }
}
