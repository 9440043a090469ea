use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tracing::{debug, instrument};

use crate::error::SyncError;
use crate::fingerprint::Fingerprint;
use crate::protocol::{ChunkPayload, ChunkStream};
use crate::store::{ChunkStore, RecipeStore, RecipeSummary, StoreError};

/// Streams a stored file back out, chunk by chunk in recipe order.
#[derive(Clone)]
pub struct Reconstructor {
    chunks: Arc<dyn ChunkStore>,
    recipes: Arc<dyn RecipeStore>,
}

impl Reconstructor {
    pub fn new(chunks: Arc<dyn ChunkStore>, recipes: Arc<dyn RecipeStore>) -> Self {
        Self { chunks, recipes }
    }

    /// Looks up the recipe of `file_id` and returns its summary along with a stream of
    /// its chunks. The whole file is never held in memory.
    #[instrument(skip(self))]
    pub async fn reconstruct(
        &self,
        file_id: &str,
    ) -> Result<(RecipeSummary, ChunkStream), SyncError> {
        let recipe = self.recipes.get(file_id).await.map_err(|err| match err {
            StoreError::NotFound => SyncError::NotFound(file_id.into()),
            err => err.into(),
        })?;
        debug!(chunks = recipe.chunks.len(), size = recipe.size, "reconstructing");

        let summary = recipe.summary();
        let stream = stream_chunks(self.chunks.clone(), recipe.file_id, recipe.chunks);
        Ok((summary, stream.boxed()))
    }
}

fn stream_chunks(
    chunks: Arc<dyn ChunkStore>,
    file_id: String,
    fingerprints: Vec<Fingerprint>,
) -> impl Stream<Item = Result<ChunkPayload, SyncError>> + Send + 'static {
    async_stream::try_stream! {
        for fingerprint in fingerprints {
            let payload = chunks.get(&fingerprint).await.map_err(|err| match err {
                StoreError::NotFound => SyncError::Integrity(format!(
                    "recipe of {file_id:?} references missing chunk {fingerprint}"
                )),
                err => SyncError::from(err),
            })?;
            yield ChunkPayload::new(fingerprint, payload);
        }
    }
}
