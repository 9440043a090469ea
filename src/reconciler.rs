use std::collections::{BTreeSet, HashSet};
use std::pin::pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::error::SyncError;
use crate::protocol::{
    ChunkPayload, GetMissingChunks, MissingChunks, UploadFrame, UploadHeader, UploadStatus,
};
use crate::store::{ChunkStore, NewRecipe, Precondition, RecipeStore, StoreError};

/// Server side of a sync attempt: works out which chunks the store lacks, takes them
/// in, and commits the new recipe once the upload is complete.
#[derive(Clone)]
pub struct Reconciler {
    chunks: Arc<dyn ChunkStore>,
    recipes: Arc<dyn RecipeStore>,
}

impl Reconciler {
    pub fn new(chunks: Arc<dyn ChunkStore>, recipes: Arc<dyn RecipeStore>) -> Self {
        Self { chunks, recipes }
    }

    /// Diffs a signature against the whole chunk store, not just the file's previous
    /// version, so content shared between files is only ever uploaded once.
    ///
    /// This is a pure read and can be retried freely.
    #[instrument(skip_all, fields(file_id = %request.file_id))]
    pub async fn get_missing_chunks(
        &self,
        request: GetMissingChunks,
    ) -> Result<MissingChunks, SyncError> {
        let present = self.chunks.exists_batch(&request.chunk_fingerprints).await?;
        let missing: BTreeSet<_> = request
            .chunk_fingerprints
            .iter()
            .filter(|fingerprint| !present.contains(fingerprint))
            .copied()
            .collect();

        let base_version = match self.recipes.get(&request.file_id).await {
            Ok(recipe) => Some(recipe.version),
            Err(StoreError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };

        info!(
            chunks = request.chunk_fingerprints.len(),
            missing = missing.len(),
            ?base_version,
            "checked sync status"
        );
        Ok(MissingChunks {
            missing_fingerprints: missing.into_iter().collect(),
            base_version,
        })
    }

    /// Consumes one upload stream.
    ///
    /// Chunks are stored as they arrive, so an aborted upload may leave some of them
    /// behind, but the recipe only moves once the end marker was seen and every chunk
    /// of the new signature is present. A chunk that is not part of the signature is
    /// refused before it reaches the store.
    pub async fn upload_chunks(
        &self,
        frames: impl Stream<Item = Result<UploadFrame, SyncError>> + Send,
    ) -> Result<UploadStatus, SyncError> {
        let mut frames = pin!(frames);

        let header = match frames.next().await {
            Some(Ok(UploadFrame::Begin(header))) => header,
            Some(Ok(_)) => {
                return Err(SyncError::Protocol(
                    "upload must start with a header".into(),
                ))
            }
            Some(Err(err)) => return Err(err),
            None => return Err(SyncError::Protocol("empty upload".into())),
        };
        let file_id = header.file_id.clone();
        let signature: HashSet<_> = header.chunk_fingerprints.iter().copied().collect();

        let mut received = 0u32;
        let mut stored = 0u32;
        loop {
            match frames.next().await {
                Some(Ok(UploadFrame::Chunk(chunk))) => {
                    if !signature.contains(&chunk.fingerprint) {
                        warn!(%file_id, fingerprint = ?chunk.fingerprint, "chunk outside signature");
                        return Err(SyncError::Protocol(format!(
                            "chunk {} is not part of the signature for {file_id:?}",
                            chunk.fingerprint
                        )));
                    }
                    received += 1;
                    if self.store_chunk(chunk).await? {
                        stored += 1;
                    }
                }
                Some(Ok(UploadFrame::End)) => break,
                Some(Ok(UploadFrame::Begin(_))) => {
                    return Err(SyncError::Protocol(
                        "upload contains more than one header".into(),
                    ))
                }
                Some(Err(err)) => {
                    warn!(%file_id, received, "upload aborted: {err}");
                    return Err(err);
                }
                None => {
                    warn!(%file_id, received, "upload ended without end marker");
                    return Err(SyncError::Protocol(
                        "upload ended before the end marker".into(),
                    ));
                }
            }
        }

        if received != header.expected_chunks {
            return Err(SyncError::Protocol(format!(
                "expected {} chunks, received {received}",
                header.expected_chunks
            )));
        }

        let version = self.commit_recipe(header).await?;
        info!(%file_id, received, stored, version, "upload complete");

        Ok(UploadStatus {
            success: true,
            message: format!("received {received} chunks for {file_id}, {stored} new"),
            stored_chunks: stored,
            recipe_version: version,
        })
    }

    async fn store_chunk(&self, chunk: ChunkPayload) -> Result<bool, SyncError> {
        chunk.verify()?;
        let fingerprint = chunk.fingerprint;
        let size = chunk.size;
        let newly_stored = self.chunks.put(fingerprint, chunk.payload).await?;
        debug!(?fingerprint, size, newly_stored, "stored chunk");
        Ok(newly_stored)
    }

    async fn commit_recipe(&self, header: UploadHeader) -> Result<u64, SyncError> {
        let sizes = self.chunks.sizes(&header.chunk_fingerprints).await?;
        let absent: BTreeSet<_> = header
            .chunk_fingerprints
            .iter()
            .filter(|fingerprint| !sizes.contains_key(fingerprint))
            .collect();
        if !absent.is_empty() {
            return Err(SyncError::Protocol(format!(
                "{} chunks of the new recipe for {:?} were never uploaded",
                absent.len(),
                header.file_id
            )));
        }

        // repeated chunks count once per occurrence
        let actual_size: u64 = header
            .chunk_fingerprints
            .iter()
            .filter_map(|fingerprint| sizes.get(fingerprint))
            .sum();
        if actual_size != header.file_size {
            return Err(SyncError::Protocol(format!(
                "{:?} declares {} bytes but its chunks add up to {actual_size}",
                header.file_id, header.file_size
            )));
        }

        let recipe = NewRecipe {
            file_id: header.file_id,
            chunks: header.chunk_fingerprints,
            size: header.file_size,
            digest: header.file_digest,
        };
        let recipe = self
            .recipes
            .put(recipe, Precondition::from_base_version(header.base_version))
            .await?;
        Ok(recipe.version)
    }
}
