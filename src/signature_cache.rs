//! Client-side record of the signature each local file had at its last successful sync.

use std::path::Path;

use fjall::{Keyspace, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, InvalidFingerprint};
use crate::store::{StoreError, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub last_modified: Timestamp,
    /// Comma separated, lowercase hex fingerprints in file order.
    pub chunk_hashes: String,
}

impl SignatureRecord {
    pub fn new(last_modified: Timestamp, signature: &[Fingerprint]) -> Self {
        let chunk_hashes = signature
            .iter()
            .map(Fingerprint::to_hex)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            last_modified,
            chunk_hashes,
        }
    }

    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>, InvalidFingerprint> {
        if self.chunk_hashes.is_empty() {
            return Ok(vec![]);
        }
        self.chunk_hashes.split(',').map(Fingerprint::from_hex).collect()
    }

    /// Whether a file with this modification time and freshly computed signature is
    /// exactly what was last synced.
    pub fn matches(&self, last_modified: Timestamp, signature: &[Fingerprint]) -> bool {
        self.last_modified == last_modified
            && self
                .fingerprints()
                .is_ok_and(|recorded| recorded == signature)
    }
}

/// fjall blocks on disk I/O, so lookups and writes run on the blocking thread pool.
pub struct SignatureCache {
    keyspace: Keyspace,
    file_index: PartitionHandle,
}

impl SignatureCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let keyspace = fjall::Config::new(path).open()?;
        let file_index = keyspace.open_partition("file_index", Default::default())?;
        Ok(Self {
            keyspace,
            file_index,
        })
    }

    pub async fn record(
        &self,
        path: &Path,
        last_modified: Timestamp,
        signature: &[Fingerprint],
    ) -> Result<(), StoreError> {
        let key = cache_key(path);
        let record = postcard::to_stdvec(&SignatureRecord::new(last_modified, signature))?;
        let keyspace = self.keyspace.clone();
        let file_index = self.file_index.clone();

        tokio::task::spawn_blocking(move || {
            file_index.insert(key, record)?;
            keyspace.persist(PersistMode::SyncAll)?;
            Ok::<_, StoreError>(())
        })
        .await?
    }

    pub async fn get(&self, path: &Path) -> Result<Option<SignatureRecord>, StoreError> {
        let key = cache_key(path);
        let file_index = self.file_index.clone();

        let stored = tokio::task::spawn_blocking(move || file_index.get(key)).await??;
        let Some(stored) = stored else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(&stored)?))
    }
}

/// The path's raw OS bytes, so that paths differing only in non-UTF-8 bytes stay apart.
fn cache_key(path: &Path) -> Vec<u8> {
    path.as_os_str().as_encoded_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_last_signature_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SignatureCache::open(dir.path()).unwrap();
        let path = Path::new("/tmp/watched/notes.txt");

        assert_eq!(cache.get(path).await.unwrap(), None);

        let first = [Fingerprint::of(b"one"), Fingerprint::of(b"two")];
        cache.record(path, Timestamp(1_000), &first).await.unwrap();
        let record = cache.get(path).await.unwrap().unwrap();
        assert_eq!(record.fingerprints().unwrap(), first);
        assert_eq!(record.chunk_hashes.split(',').count(), 2);

        let second = [Fingerprint::of(b"three")];
        cache.record(path, Timestamp(2_000), &second).await.unwrap();
        let record = cache.get(path).await.unwrap().unwrap();
        assert_eq!(record.last_modified, Timestamp(2_000));
        assert!(record.matches(Timestamp(2_000), &second));
        assert!(!record.matches(Timestamp(2_001), &second));
        assert!(!record.matches(Timestamp(2_000), &first));
    }

    #[test]
    fn empty_signature_round_trips() {
        let record = SignatureRecord::new(Timestamp(5), &[]);
        assert_eq!(record.chunk_hashes, "");
        assert!(record.fingerprints().unwrap().is_empty());
        assert!(record.matches(Timestamp(5), &[]));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = Path::new("report.csv");
        let signature = [Fingerprint::of(b"row")];
        {
            let cache = SignatureCache::open(dir.path()).unwrap();
            cache.record(path, Timestamp(7), &signature).await.unwrap();
        }
        let cache = SignatureCache::open(dir.path()).unwrap();
        assert!(cache.get(path).await.unwrap().unwrap().matches(Timestamp(7), &signature));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_paths_keep_separate_records() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = SignatureCache::open(dir.path()).unwrap();
        // both would collapse to "/tmp/\u{FFFD}" under a lossy conversion
        let first = Path::new(OsStr::from_bytes(b"/tmp/\xff"));
        let second = Path::new(OsStr::from_bytes(b"/tmp/\xfe"));

        cache
            .record(first, Timestamp(1), &[Fingerprint::of(b"first")])
            .await
            .unwrap();
        assert_eq!(cache.get(second).await.unwrap(), None);

        cache
            .record(second, Timestamp(2), &[Fingerprint::of(b"second")])
            .await
            .unwrap();
        let record = cache.get(first).await.unwrap().unwrap();
        assert!(record.matches(Timestamp(1), &[Fingerprint::of(b"first")]));
        let record = cache.get(second).await.unwrap().unwrap();
        assert!(record.matches(Timestamp(2), &[Fingerprint::of(b"second")]));
    }
}
