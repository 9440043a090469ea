//! Messages of the sync protocol and the transport-independent service trait.
//!
//! A sync attempt is two calls: `get_missing_chunks` with the file's signature, then one
//! `upload_chunks` stream that starts with an [`UploadHeader`], carries every chunk the
//! server reported missing, and is terminated by [`UploadFrame::End`]. The recipe is only
//! committed once the end marker has been processed.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::error::{ErrorResponse, SyncError};
use crate::fingerprint::{FileDigest, Fingerprint};
use crate::store::RecipeSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMissingChunks {
    pub file_id: String,
    pub chunk_fingerprints: Vec<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingChunks {
    /// Sorted and free of duplicates.
    pub missing_fingerprints: Vec<Fingerprint>,
    /// Version of the recipe the server had when answering, if any.
    pub base_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHeader {
    pub file_id: String,
    pub chunk_fingerprints: Vec<Fingerprint>,
    pub file_size: u64,
    pub file_digest: FileDigest,
    pub base_version: Option<u64>,
    /// Number of chunk frames between this header and the end marker.
    pub expected_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadFrame {
    Begin(UploadHeader),
    Chunk(ChunkPayload),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub success: bool,
    pub message: String,
    /// Chunks from this upload that were not yet in the store.
    pub stored_chunks: u32,
    pub recipe_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadFrame {
    Header(RecipeSummary),
    Chunk(ChunkPayload),
    /// Sent in place of the remaining chunks when reconstruction fails midway.
    Error(ErrorResponse),
}

/// A self-describing chunk as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub fingerprint: Fingerprint,
    pub size: u32,
    pub payload: Bytes,
}

impl ChunkPayload {
    pub fn new(fingerprint: Fingerprint, payload: Bytes) -> Self {
        Self {
            fingerprint,
            size: payload.len() as u32,
            payload,
        }
    }

    /// Checks that the payload really is the chunk it claims to be.
    pub fn verify(&self) -> Result<(), SyncError> {
        if self.size as usize != self.payload.len() {
            return Err(SyncError::Integrity(format!(
                "chunk {} claims {} bytes but carries {}",
                self.fingerprint,
                self.size,
                self.payload.len()
            )));
        }
        let actual = Fingerprint::of(&self.payload);
        if actual != self.fingerprint {
            return Err(SyncError::Integrity(format!(
                "chunk {} hashes to {actual}",
                self.fingerprint
            )));
        }
        Ok(())
    }
}

impl From<&Chunk> for ChunkPayload {
    fn from(chunk: &Chunk) -> Self {
        Self::new(chunk.fingerprint, chunk.payload.clone())
    }
}

pub type UploadStream = BoxStream<'static, Result<UploadFrame, SyncError>>;
pub type ChunkStream = BoxStream<'static, Result<ChunkPayload, SyncError>>;

/// The sync service as seen by a client, independent of how calls reach the server.
#[async_trait::async_trait]
pub trait DeltaSync: Send + Sync {
    async fn get_missing_chunks(
        &self,
        request: GetMissingChunks,
    ) -> Result<MissingChunks, SyncError>;

    async fn upload_chunks(&self, frames: UploadStream) -> Result<UploadStatus, SyncError>;

    /// The recipe summary of `file_id`, then its chunks in recipe order.
    async fn download_file(&self, file_id: &str)
        -> Result<(RecipeSummary, ChunkStream), SyncError>;

    async fn list_files(&self) -> Result<Vec<RecipeSummary>, SyncError>;
}
