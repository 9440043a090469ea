//! The sync service, callable in process or over HTTP.

use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio_util::io::StreamReader;
use tracing::{error, warn};

use crate::error::{ErrorKind, SyncError};
use crate::protocol::{
    ChunkStream, DeltaSync, DownloadFrame, DownloadRequest, GetMissingChunks, MissingChunks,
    UploadStatus, UploadStream,
};
use crate::reconciler::Reconciler;
use crate::reconstructor::Reconstructor;
use crate::store::{ChunkStore, RecipeStore, RecipeSummary};
use crate::wire;

#[derive(Clone)]
pub struct SyncServer {
    reconciler: Reconciler,
    reconstructor: Reconstructor,
    recipes: Arc<dyn RecipeStore>,
}

impl SyncServer {
    pub fn new(chunks: Arc<dyn ChunkStore>, recipes: Arc<dyn RecipeStore>) -> Self {
        Self {
            reconciler: Reconciler::new(chunks.clone(), recipes.clone()),
            reconstructor: Reconstructor::new(chunks, recipes.clone()),
            recipes,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/missing", post(missing_chunks))
            .route("/upload", post(upload_chunks))
            .route("/download", post(download_file))
            .route("/files", get(list_files))
            .layer(DefaultBodyLimit::max(wire::MAX_FRAME_LENGTH))
            .with_state(self.clone())
    }
}

#[async_trait::async_trait]
impl DeltaSync for SyncServer {
    async fn get_missing_chunks(
        &self,
        request: GetMissingChunks,
    ) -> Result<MissingChunks, SyncError> {
        self.reconciler.get_missing_chunks(request).await
    }

    async fn upload_chunks(&self, frames: UploadStream) -> Result<UploadStatus, SyncError> {
        self.reconciler.upload_chunks(frames).await
    }

    async fn download_file(
        &self,
        file_id: &str,
    ) -> Result<(RecipeSummary, ChunkStream), SyncError> {
        self.reconstructor.reconstruct(file_id).await
    }

    async fn list_files(&self) -> Result<Vec<RecipeSummary>, SyncError> {
        Ok(self.recipes.list().await?)
    }
}

async fn missing_chunks(
    State(server): State<SyncServer>,
    body: Bytes,
) -> Result<Response, SyncError> {
    let request: GetMissingChunks = wire::decode(&body)?;
    let response = server.get_missing_chunks(request).await?;
    encoded(&response)
}

async fn upload_chunks(
    State(server): State<SyncServer>,
    body: Body,
) -> Result<Response, SyncError> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let frames = wire::decode_frames(StreamReader::new(stream));
    let status = server.reconciler.upload_chunks(frames).await?;
    encoded(&status)
}

async fn download_file(
    State(server): State<SyncServer>,
    body: Bytes,
) -> Result<Response, SyncError> {
    let request: DownloadRequest = wire::decode(&body)?;
    let (summary, chunks) = server.download_file(&request.file_id).await?;
    let frames = download_frames(summary, chunks);
    Ok((
        [(header::CONTENT_TYPE, wire::CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn list_files(State(server): State<SyncServer>) -> Result<Response, SyncError> {
    encoded(&server.list_files().await?)
}

/// The response is already streaming by the time a chunk fails to load, so the failure
/// is reported in band as the last frame.
fn download_frames(
    summary: RecipeSummary,
    mut chunks: ChunkStream,
) -> impl Stream<Item = Result<Bytes, SyncError>> + Send + 'static {
    async_stream::try_stream! {
        let file_id = summary.file_id.clone();
        yield wire::encode_frame(&DownloadFrame::Header(summary))?;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    yield wire::encode_frame(&DownloadFrame::Chunk(chunk))?;
                }
                Err(err) => {
                    error!(%file_id, "download failed: {err}");
                    yield wire::encode_frame(&DownloadFrame::Error(err.to_response()))?;
                    break;
                }
            }
        }
    }
}

fn encoded<T: Serialize>(message: &T) -> Result<Response, SyncError> {
    let body = wire::encode(message)?;
    Ok(([(header::CONTENT_TYPE, wire::CONTENT_TYPE)], body).into_response())
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
            // on the server, transport failures come from reading the request body
            ErrorKind::Protocol | ErrorKind::Transport => StatusCode::BAD_REQUEST,
            ErrorKind::Chunking | ErrorKind::Storage | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let response = self.to_response();
        if status.is_server_error() {
            error!(kind = ?response.kind, "request failed: {}", response.detail);
        } else {
            warn!(kind = ?response.kind, "request rejected: {}", response.detail);
        }

        match wire::encode(&response) {
            Ok(body) => (status, [(header::CONTENT_TYPE, wire::CONTENT_TYPE)], body).into_response(),
            Err(_) => status.into_response(),
        }
    }
}
